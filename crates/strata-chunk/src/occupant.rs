//! Occupant records and the entity-simulation seams.
//!
//! The chunk manager never owns live entities. It hands buffered
//! [`OccupantRecord`]s to an [`OccupantFactory`] to bring them to life and
//! asks the factory to turn live handles back into records. Positions and
//! chunk affiliation are read and written through [`EntityComponents`].

use serde::{Deserialize, Serialize};
use strata_spatial::EntityHandle;

use crate::coord::{ChunkCoord, LayerId};

/// Whether an occupant moves during simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OccupantKind {
    /// Placed once, never moves.
    Static,
    /// Position may change every tick.
    Dynamic,
}

/// A serialized occupant, as buffered in a dormant chunk and persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OccupantRecord {
    /// Persistent occupant id, stable across activations.
    pub id: u64,
    pub kind: OccupantKind,
    /// World position.
    pub x: f64,
    pub y: f64,
    /// Owning chunk.
    pub coord: ChunkCoord,
    pub layer: LayerId,
    /// Opaque simulation state.
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Current world placement of a live entity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Placement {
    pub kind: OccupantKind,
    pub x: f64,
    pub y: f64,
}

/// Which chunk a live entity currently belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkAffiliation {
    pub current: ChunkCoord,
    /// The chunk it belonged to before its last migration.
    pub previous: Option<ChunkCoord>,
}

impl ChunkAffiliation {
    /// Affiliation of a freshly instantiated entity.
    pub fn new(current: ChunkCoord) -> Self {
        Self { current, previous: None }
    }
}

/// Errors raised by the entity simulation.
#[derive(Debug, thiserror::Error)]
pub enum OccupantError {
    /// A record could not be turned into a live entity.
    #[error("failed to instantiate occupant {id}: {reason}")]
    Instantiate { id: u64, reason: String },

    /// A live entity could not be turned into a record.
    #[error("failed to serialize entity {handle}: {reason}")]
    Serialize { handle: EntityHandle, reason: String },

    /// The handle does not refer to a live entity.
    #[error("unknown entity {0}")]
    UnknownEntity(EntityHandle),
}

/// Creates and destroys live entities.
pub trait OccupantFactory: Send + Sync {
    /// Spawns a live entity from a buffered record.
    fn instantiate(&self, record: &OccupantRecord) -> Result<EntityHandle, OccupantError>;

    /// Captures a live entity as a record. The entity stays live.
    fn serialize(&self, handle: EntityHandle) -> Result<OccupantRecord, OccupantError>;

    /// Removes a live entity from the simulation.
    fn despawn(&self, handle: EntityHandle);
}

/// Read/write access to the components the chunk manager needs.
pub trait EntityComponents: Send + Sync {
    fn affiliation(&self, handle: EntityHandle) -> Option<ChunkAffiliation>;

    fn set_affiliation(&self, handle: EntityHandle, affiliation: ChunkAffiliation);

    fn placement(&self, handle: EntityHandle) -> Option<Placement>;
}
