//! Write ordering for saves.
//!
//! Every save is issued a [`WriteTicket`] when its snapshot is taken. The
//! ledger remembers, per written key, the newest ticket version issued while
//! any ticket for that key is still alive. A write that lands after a newer
//! snapshot of the same key was taken (a timed-out save finishing late, a
//! retry of a superseded snapshot) sees that its version is behind and
//! skips the key.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::chunk::ChunkSnapshot;
use crate::coord::ChunkCoord;

/// One unit of persisted data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WriteKey {
    /// A chunk's tile payload.
    Tiles(ChunkCoord),
    /// An occupant record, by id.
    Occupant(u64),
}

#[derive(Debug)]
struct Slot {
    newest: u64,
    outstanding: usize,
}

/// Newest issued version per key.
#[derive(Debug, Default)]
pub struct SaveLedger {
    next: AtomicU64,
    skipped: AtomicU64,
    slots: DashMap<WriteKey, Slot>,
}

impl SaveLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a ticket covering every key `snapshot` writes. Later tickets
    /// supersede earlier ones on the keys they share.
    pub fn issue(self: &Arc<Self>, snapshot: &ChunkSnapshot) -> Arc<WriteTicket> {
        let version = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let mut keys: Vec<WriteKey> = snapshot
            .occupants
            .iter()
            .map(|record| WriteKey::Occupant(record.id))
            .collect();
        if snapshot.writes_tiles() {
            keys.push(WriteKey::Tiles(snapshot.coord));
        }
        keys.sort_unstable();
        keys.dedup();

        for &key in &keys {
            self.slots
                .entry(key)
                .and_modify(|slot| {
                    slot.newest = slot.newest.max(version);
                    slot.outstanding += 1;
                })
                .or_insert(Slot {
                    newest: version,
                    outstanding: 1,
                });
        }
        Arc::new(WriteTicket {
            ledger: Arc::clone(self),
            version,
            keys,
        })
    }

    /// Writes skipped so far because a newer ticket held the key.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Keys with at least one live ticket.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Permission to write one snapshot's keys, valid until a newer snapshot
/// of the same key is taken.
#[derive(Debug)]
pub struct WriteTicket {
    ledger: Arc<SaveLedger>,
    version: u64,
    keys: Vec<WriteKey>,
}

impl WriteTicket {
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns `false` if a newer ticket has been issued for `key`.
    pub fn is_current(&self, key: &WriteKey) -> bool {
        self.ledger
            .slots
            .get(key)
            .is_none_or(|slot| slot.newest <= self.version)
    }

    /// Like [`is_current`](Self::is_current), but counts a refusal in the
    /// ledger's [`skipped`](SaveLedger::skipped) total. Call right before
    /// writing `key`.
    pub fn claim(&self, key: &WriteKey) -> bool {
        let current = self.is_current(key);
        if !current {
            self.ledger.skipped.fetch_add(1, Ordering::Relaxed);
        }
        current
    }
}

impl Drop for WriteTicket {
    fn drop(&mut self) {
        for key in &self.keys {
            let emptied = match self.ledger.slots.get_mut(key) {
                Some(mut slot) => {
                    slot.outstanding = slot.outstanding.saturating_sub(1);
                    slot.outstanding == 0
                }
                None => false,
            };
            if emptied {
                self.ledger.slots.remove_if(key, |_, slot| slot.outstanding == 0);
            }
        }
    }
}
