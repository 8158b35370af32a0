//! Manager counters and the stats snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::coord::LayerId;

/// Cumulative event counters, updated lock-free.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub load_requests: AtomicU64,
    pub loads_dropped: AtomicU64,
    pub loads_completed: AtomicU64,
    pub loads_degraded: AtomicU64,
    pub loads_timed_out: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub evictions: AtomicU64,
    pub saves_completed: AtomicU64,
    pub saves_inline: AtomicU64,
    pub saves_failed: AtomicU64,
    pub occupant_failures: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of a manager.
///
/// Gauges (`resident` .. `pending_saves`) are read without a global lock and
/// may be mutually inconsistent under concurrent activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub layer: LayerId,
    /// Chunks in the table, in any state.
    pub resident: usize,
    pub active: usize,
    pub preloaded: usize,
    /// Resident chunks neither active nor preloaded.
    pub inactive: usize,
    /// Chunks in the eviction cache.
    pub cached: usize,
    pub load_queue_depth: usize,
    pub save_queue_depth: usize,
    /// Evicted snapshots not yet confirmed written.
    pub pending_saves: usize,
    /// Live entities left unserialized by deactivation, summed over
    /// resident chunks.
    pub stranded: usize,

    pub load_requests: u64,
    pub loads_dropped: u64,
    pub loads_completed: u64,
    pub loads_degraded: u64,
    /// Loads abandoned because storage missed the deadline or the IO pool
    /// was saturated.
    pub loads_timed_out: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub saves_completed: u64,
    pub saves_inline: u64,
    pub saves_failed: u64,
    /// Tile payloads and occupant records a save skipped because a newer
    /// snapshot of the same data had been taken.
    pub writes_superseded: u64,
    /// Occupants that failed to instantiate or serialize.
    pub occupant_failures: u64,
    /// Dynamic index updates for handles missing from their old cell,
    /// summed over resident chunks.
    pub missed_updates: u64,
}

impl std::fmt::Display for ManagerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} resident ({} active, {} preloaded, {} cached), loads {}/{} ({} dropped), \
             saves {} ({} inline, {} failed, {} pending), evictions {}",
            self.layer,
            self.resident,
            self.active,
            self.preloaded,
            self.cached,
            self.loads_completed,
            self.load_requests,
            self.loads_dropped,
            self.saves_completed,
            self.saves_inline,
            self.saves_failed,
            self.pending_saves,
            self.evictions,
        )
    }
}
