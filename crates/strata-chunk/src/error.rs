//! Chunk manager error types.

use strata_spatial::EntityHandle;

use crate::coord::ChunkCoord;
use crate::occupant::OccupantError;

/// Errors returned by [`ChunkManager`](crate::ChunkManager) operations.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// No chunk is resident at the coordinate.
    #[error("chunk {0} is not resident")]
    ChunkNotFound(ChunkCoord),

    /// The operation requires an active chunk.
    #[error("chunk {0} is not active")]
    ChunkNotActive(ChunkCoord),

    /// The chunk has no loaded data yet; a load was requested.
    #[error("chunk {0} is not loaded yet")]
    ChunkNotLoaded(ChunkCoord),

    /// A chunk state word held a value outside the lifecycle.
    #[error("invalid chunk state value {0}")]
    InvalidChunkState(u8),

    /// The entity has no placement or affiliation components.
    #[error("entity {0} not found")]
    EntityNotFound(EntityHandle),

    /// The entity's affiliation disagrees with the caller's source chunk.
    #[error("entity {entity} belongs to chunk {actual}, not {expected}")]
    EntityNotInChunk {
        entity: EntityHandle,
        expected: ChunkCoord,
        actual: ChunkCoord,
    },

    /// The entity's placement does not match where the chunk's index holds
    /// it, so it cannot be removed from that index.
    #[error("entity {entity} is not indexed in chunk {chunk} at its current placement")]
    EntityNotIndexed { entity: EntityHandle, chunk: ChunkCoord },

    /// Instantiating or serializing an occupant failed.
    #[error(transparent)]
    Occupant(#[from] OccupantError),

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The manager has been shut down.
    #[error("chunk manager is shutting down")]
    ShuttingDown,
}
