//! Scripted observer walk.
//!
//! Stands in for the game's tick loop: an observer crosses the world from
//! west to east, chunks around it are activated and those it leaves behind
//! are deactivated, and dynamic occupants drift east so they cross chunk
//! borders and migrate.

use strata_chunk::{ChunkCoord, ChunkError, ChunkManager, EntityComponents, MemoryWorld, MigrationOutcome};
use tracing::{debug, warn};

/// Ticks the observer needs to cross one chunk.
pub const TICKS_PER_CHUNK: u64 = 8;

/// Ticks a dynamic occupant needs to cross one chunk.
const DRIFT_TICKS_PER_CHUNK: f64 = 40.0;

/// Counts gathered over a walk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkStats {
    pub observer_moves: u64,
    pub activations_pending: u64,
    pub migrations: u64,
    pub reindexed: u64,
    pub buffered: u64,
}

pub struct Walk<'a> {
    managers: &'a [ChunkManager],
    world: &'a MemoryWorld,
    chunk_size: f64,
    active_radius: u32,
    observer: Option<ChunkCoord>,
    stats: WalkStats,
}

impl<'a> Walk<'a> {
    /// `active_radius` chunks around the observer are kept active; it is
    /// clamped to the preload radius of the first manager.
    pub fn new(managers: &'a [ChunkManager], world: &'a MemoryWorld, chunk_size: f64, active_radius: u32) -> Self {
        let preload_radius = managers
            .first()
            .map_or(active_radius, |m| m.config().preload_radius);
        Self {
            managers,
            world,
            chunk_size,
            active_radius: active_radius.min(preload_radius),
            observer: None,
            stats: WalkStats::default(),
        }
    }

    /// World position of the observer at `tick`.
    pub fn observer_position(&self, tick: u64) -> (f64, f64) {
        let x = tick as f64 * self.chunk_size / TICKS_PER_CHUNK as f64;
        (x, self.chunk_size * 0.5)
    }

    pub fn observer(&self) -> Option<ChunkCoord> {
        self.observer
    }

    pub fn stats(&self) -> WalkStats {
        self.stats
    }

    /// Advances every layer by one tick.
    pub fn step(&mut self, tick: u64) {
        let (x, y) = self.observer_position(tick);
        let coord = ChunkCoord::from_world(x, y, self.chunk_size);

        if self.observer != Some(coord) {
            for manager in self.managers {
                let diff = manager.on_observer_moved(coord);
                debug!(
                    layer = %manager.layer(),
                    %coord,
                    entered = diff.entered.len(),
                    left = diff.left.len(),
                    "observer changed chunk"
                );
            }
            self.observer = Some(coord);
            self.stats.observer_moves += 1;
        }

        for manager in self.managers {
            self.refresh_active(manager, coord);
            self.drift(manager);
            if let Some(chunk) = manager.get_chunk(coord)
                && chunk.is_loaded()
            {
                chunk.set_last_tick(tick);
            }
        }
    }

    fn refresh_active(&mut self, manager: &ChunkManager, center: ChunkCoord) {
        for coord in manager.active_chunk_coords() {
            if !coord.is_neighbor(center, self.active_radius)
                && let Err(err) = manager.deactivate(coord)
            {
                warn!(layer = %manager.layer(), %coord, "deactivate failed: {err}");
            }
        }
        for coord in center.neighborhood(self.active_radius) {
            match manager.activate(coord) {
                Ok(()) => {}
                Err(ChunkError::ChunkNotLoaded(_)) => self.stats.activations_pending += 1,
                Err(err) => warn!(layer = %manager.layer(), %coord, "activate failed: {err}"),
            }
        }
    }

    /// Moves every dynamic occupant of the layer's active chunks east and
    /// migrates those that crossed a border.
    ///
    /// The source index is updated before migrating so that the entity's
    /// placement and its index entry agree.
    fn drift(&mut self, manager: &ChunkManager) {
        let step = self.chunk_size / DRIFT_TICKS_PER_CHUNK;
        for chunk in manager.active_chunks() {
            let Some(index) = chunk.spatial() else {
                continue;
            };
            let from = chunk.coord();
            for handle in index.dynamic_handles() {
                let Some(placement) = self.world.placement(handle) else {
                    continue;
                };
                let (nx, ny) = (placement.x + step, placement.y);
                if self.world.move_to(handle, nx, ny).is_none() {
                    continue;
                }
                index.update_dynamic(handle, placement.x, placement.y, nx, ny);

                let to = ChunkCoord::from_world(nx, ny, self.chunk_size);
                if to == from {
                    continue;
                }
                match manager.migrate_object(handle, from, to) {
                    Ok(outcome) => {
                        self.stats.migrations += 1;
                        match outcome {
                            MigrationOutcome::Reindexed => self.stats.reindexed += 1,
                            MigrationOutcome::Buffered => self.stats.buffered += 1,
                            MigrationOutcome::Unchanged => {}
                        }
                    }
                    Err(err) => debug!(layer = %manager.layer(), %from, %to, "migration skipped: {err}"),
                }
            }
        }
    }
}
