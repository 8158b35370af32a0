//! Size- and TTL-bounded recency cache of evictable keys.
//!
//! The cache holds keys only; it decides *when* something should go, and the
//! caller does the going. Recency is tracked with stamped entries in a
//! queue: touching a key pushes a fresh stamp and leaves the old one behind
//! as a stale entry that is skipped when popped.

use std::collections::VecDeque;
use std::hash::Hash;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy)]
struct Entry {
    stamp: u64,
    touched: Instant,
}

/// Recency-ordered set of keys with a capacity and an idle TTL.
#[derive(Debug)]
pub struct RecencyCache<K> {
    capacity: usize,
    ttl: Duration,
    entries: FxHashMap<K, Entry>,
    order: VecDeque<(K, u64)>,
    stamp: u64,
}

impl<K: Copy + Eq + Hash> RecencyCache<K> {
    /// A zero `ttl` disables time-based expiry.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: FxHashMap::default(),
            order: VecDeque::new(),
            stamp: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts or refreshes `key` as most recently used.
    ///
    /// Returns the least recently used keys pushed out by the capacity bound,
    /// oldest first. With capacity 0 the key itself is returned.
    pub fn insert(&mut self, key: K, now: Instant) -> Vec<K> {
        self.stamp = self.stamp.wrapping_add(1).max(1);
        let stamp = self.stamp;
        self.entries.insert(key, Entry { stamp, touched: now });
        self.order.push_back((key, stamp));

        let mut overflow = Vec::new();
        while self.entries.len() > self.capacity {
            match self.pop_oldest() {
                Some(oldest) => overflow.push(oldest),
                None => break,
            }
        }
        self.maybe_compact();
        overflow
    }

    /// Inserts or refreshes `key` without applying the capacity bound.
    ///
    /// For keys the caller tried and failed to evict: pushing others out to
    /// make room would only repeat the attempt. The key still leaves on
    /// expiry, removal or a later overflow.
    pub fn park(&mut self, key: K, now: Instant) {
        self.stamp = self.stamp.wrapping_add(1).max(1);
        let stamp = self.stamp;
        self.entries.insert(key, Entry { stamp, touched: now });
        self.order.push_back((key, stamp));
        self.maybe_compact();
    }

    /// Removes `key`. Returns `true` if it was present.
    pub fn remove(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Removes and returns every key idle for at least the TTL, oldest first.
    pub fn expire(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();
        if self.ttl.is_zero() {
            return expired;
        }
        while let Some(&(key, stamp)) = self.order.front() {
            match self.entries.get(&key) {
                Some(entry) if entry.stamp == stamp => {
                    if now.saturating_duration_since(entry.touched) < self.ttl {
                        break;
                    }
                    self.order.pop_front();
                    self.entries.remove(&key);
                    expired.push(key);
                }
                _ => {
                    self.order.pop_front();
                }
            }
        }
        expired
    }

    /// Removes and returns every key, oldest first.
    pub fn drain(&mut self) -> Vec<K> {
        let mut all = Vec::with_capacity(self.entries.len());
        while let Some(key) = self.pop_oldest() {
            all.push(key);
        }
        self.order.clear();
        all
    }

    fn pop_oldest(&mut self) -> Option<K> {
        while let Some((key, stamp)) = self.order.pop_front() {
            if self.entries.get(&key).is_some_and(|e| e.stamp == stamp) {
                self.entries.remove(&key);
                return Some(key);
            }
        }
        None
    }

    fn maybe_compact(&mut self) {
        let max = self.entries.len().saturating_mul(8).max(1024);
        if self.order.len() <= max {
            return;
        }
        let mut live: Vec<(K, u64)> = self.entries.iter().map(|(k, e)| (*k, e.stamp)).collect();
        live.sort_unstable_by_key(|&(_, stamp)| stamp);
        self.order = live.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize, ttl_secs: u64) -> RecencyCache<u32> {
        RecencyCache::new(capacity, Duration::from_secs(ttl_secs))
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let now = Instant::now();
        let mut c = cache(2, 0);
        assert!(c.insert(1, now).is_empty());
        assert!(c.insert(2, now).is_empty());
        assert_eq!(c.insert(3, now), vec![1]);
        assert!(!c.contains(&1));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_reinsert_refreshes_recency() {
        let now = Instant::now();
        let mut c = cache(2, 0);
        c.insert(1, now);
        c.insert(2, now);
        c.insert(1, now);
        assert_eq!(c.insert(3, now), vec![2]);
        assert!(c.contains(&1));
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let mut c = cache(0, 0);
        assert_eq!(c.insert(7, Instant::now()), vec![7]);
        assert!(c.is_empty());
    }

    #[test]
    fn test_park_ignores_capacity() {
        let t0 = Instant::now();
        let mut c = RecencyCache::new(1, Duration::from_secs(60));
        c.insert(1, t0);
        c.park(2, t0);
        assert_eq!(c.len(), 2);
        assert!(c.contains(&1) && c.contains(&2));

        assert_eq!(c.expire(t0 + Duration::from_secs(60)), vec![1, 2]);
    }

    #[test]
    fn test_remove_is_skipped_by_eviction() {
        let now = Instant::now();
        let mut c = cache(2, 0);
        c.insert(1, now);
        c.insert(2, now);
        assert!(c.remove(&1));
        assert!(!c.remove(&1));
        assert!(c.insert(3, now).is_empty());
        assert_eq!(c.insert(4, now), vec![2]);
    }

    #[test]
    fn test_expire_respects_ttl() {
        let t0 = Instant::now();
        let mut c = cache(10, 60);
        c.insert(1, t0);
        c.insert(2, t0 + Duration::from_secs(30));

        assert!(c.expire(t0 + Duration::from_secs(59)).is_empty());
        assert_eq!(c.expire(t0 + Duration::from_secs(60)), vec![1]);
        assert_eq!(c.expire(t0 + Duration::from_secs(120)), vec![2]);
        assert!(c.is_empty());
    }

    #[test]
    fn test_refresh_postpones_expiry() {
        let t0 = Instant::now();
        let mut c = cache(10, 60);
        c.insert(1, t0);
        c.insert(1, t0 + Duration::from_secs(50));
        assert!(c.expire(t0 + Duration::from_secs(70)).is_empty());
        assert_eq!(c.expire(t0 + Duration::from_secs(110)), vec![1]);
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let t0 = Instant::now();
        let mut c = cache(10, 0);
        c.insert(1, t0);
        assert!(c.expire(t0 + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_drain_returns_oldest_first() {
        let now = Instant::now();
        let mut c = cache(10, 0);
        c.insert(3, now);
        c.insert(1, now);
        c.insert(2, now);
        c.insert(3, now);
        assert_eq!(c.drain(), vec![1, 2, 3]);
        assert!(c.is_empty());
    }

    #[test]
    fn test_repeated_touches_stay_bounded() {
        let now = Instant::now();
        let mut c = cache(4, 0);
        for i in 0..5000u32 {
            c.insert(i % 4, now);
        }
        assert_eq!(c.len(), 4);
        assert!(c.order.len() <= 1024 + 1);
        assert_eq!(c.drain().len(), 4);
    }
}
