//! Preload zone maintenance.
//!
//! The zone is the union of the Chebyshev neighbourhoods around every
//! observer. Each observer update recomputes it and diffs against the
//! previous zone: coordinates that left go to the eviction cache, those that
//! entered are pulled out of the cache and loaded.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use super::Inner;
use super::stats::Counters;
use crate::coord::ChunkCoord;

/// Identifies something whose position keeps chunks warm, usually a player.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub u64);

impl ObserverId {
    /// The observer used by [`ChunkManager::on_observer_moved`](super::ChunkManager::on_observer_moved).
    pub const PRIMARY: ObserverId = ObserverId(0);
}

/// What an observer update changed, sorted by coordinate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadDiff {
    /// Newly inside the zone and not active.
    pub entered: Vec<ChunkCoord>,
    /// No longer inside the zone and not active.
    pub left: Vec<ChunkCoord>,
}

impl PreloadDiff {
    pub fn is_empty(&self) -> bool {
        self.entered.is_empty() && self.left.is_empty()
    }
}

fn zone_of<'a>(observers: impl Iterator<Item = &'a ChunkCoord>, radius: u32) -> FxHashSet<ChunkCoord> {
    let mut zone = FxHashSet::default();
    for center in observers {
        zone.extend(center.neighborhood(radius));
    }
    zone
}

impl Inner {
    pub(super) fn update_observer(&self, observer: ObserverId, coord: ChunkCoord) -> PreloadDiff {
        self.rezone(|observers| {
            if observers.get(&observer) == Some(&coord) {
                return false;
            }
            observers.insert(observer, coord);
            true
        })
    }

    pub(super) fn remove_observer(&self, observer: ObserverId) -> PreloadDiff {
        self.rezone(|observers| observers.remove(&observer).is_some())
    }

    pub(super) fn preload_zone(&self) -> Vec<ChunkCoord> {
        super::sorted(&self.sets.read().zone)
    }

    /// Applies `edit` to the observer map and, if it reports a change,
    /// recomputes the zone and reconciles chunks with it.
    fn rezone(
        &self,
        edit: impl FnOnce(&mut FxHashMap<ObserverId, ChunkCoord>) -> bool,
    ) -> PreloadDiff {
        if self.is_shutting_down() {
            return PreloadDiff::default();
        }

        let mut diff = {
            let mut sets = self.sets.write();
            if !edit(&mut sets.observers) {
                return PreloadDiff::default();
            }
            let zone = zone_of(sets.observers.values(), self.config.preload_radius);

            let left: Vec<ChunkCoord> = sets
                .zone
                .difference(&zone)
                .filter(|c| !sets.active.contains(c))
                .copied()
                .collect();
            let entered: Vec<ChunkCoord> = zone
                .difference(&sets.zone)
                .filter(|c| !sets.active.contains(c))
                .copied()
                .collect();

            for coord in &left {
                sets.preloaded.remove(coord);
            }
            sets.zone = zone;
            PreloadDiff { entered, left }
        };
        diff.entered.sort_unstable();
        diff.left.sort_unstable();

        let parked: Vec<ChunkCoord> = {
            let chunks = self.chunks.read();
            diff.left.iter().copied().filter(|c| chunks.contains_key(c)).collect()
        };
        let overflow = {
            let now = self.deps.clock.now();
            let mut cache = self.cache.lock();
            let mut overflow = Vec::new();
            for coord in parked {
                overflow.extend(cache.insert(coord, now));
            }
            for coord in &diff.entered {
                if cache.remove(coord) {
                    Counters::bump(&self.counters.cache_hits);
                } else {
                    Counters::bump(&self.counters.cache_misses);
                }
            }
            overflow
        };

        for coord in &diff.entered {
            self.request_load(*coord);
        }
        for coord in overflow {
            self.evict(coord, super::eviction::SaveMode::Queued);
        }

        debug!(
            entered = diff.entered.len(),
            left = diff.left.len(),
            "preload zone updated"
        );
        diff
    }
}
