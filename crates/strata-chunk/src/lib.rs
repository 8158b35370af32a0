//! Chunk lifecycle and spatial caching for one world layer.
//!
//! A [`ChunkManager`] owns every chunk of a layer, moves chunks through
//! `Unloaded → Loading → Preloaded → Active` and back, keeps a preload zone
//! around observers, evicts idle chunks through a size- and TTL-bounded
//! recency cache, and runs bounded background pools for storage loads and
//! saves. Storage, the entity simulation and load/unload consumers are
//! injected through the traits in [`store`], [`occupant`] and [`events`].

pub mod cache;
pub mod chunk;
pub mod clock;
pub mod coord;
pub mod error;
pub mod events;
pub mod ledger;
pub mod manager;
pub mod memory;
pub mod occupant;
pub mod queue;
pub mod store;

pub use cache::RecencyCache;
pub use chunk::{Chunk, ChunkSnapshot, ChunkState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coord::{ChunkCoord, LayerId};
pub use error::ChunkError;
pub use events::{ChannelSink, ChunkEvent, ChunkEventSink, ChunkLoaded, ChunkUnloaded, NullSink};
pub use ledger::{SaveLedger, WriteKey, WriteTicket};
pub use manager::{
    ChunkManager, ManagerConfig, ManagerDeps, ManagerStats, MigrationOutcome, ObserverId,
    PreloadDiff,
};
pub use memory::{MemoryStore, MemoryWorld};
pub use occupant::{
    ChunkAffiliation, EntityComponents, OccupantError, OccupantFactory, OccupantKind,
    OccupantRecord, Placement,
};
pub use store::{ChunkStore, IoPool, StorageError, StoredTiles};
pub use strata_spatial::{EntityHandle, SpatialIndex};
