//! Eviction, the save path and failed-save retry.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::stats::Counters;
use super::{Inner, PendingSave};
use crate::chunk::{Chunk, ChunkSnapshot, ChunkState};
use crate::coord::ChunkCoord;
use crate::events::ChunkUnloaded;
use crate::ledger::WriteKey;
use crate::queue::{SaveDispatch, SaveJob, SaveOrigin};

/// Where a save runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SaveMode {
    /// Through the save pool, falling back to inline when it is full.
    Queued,
    /// On the calling thread.
    Inline,
}

impl Inner {
    /// Evicts chunks pushed out of the cache by its capacity bound.
    pub(super) fn evict_overflow(&self, overflow: Vec<ChunkCoord>) {
        for coord in overflow {
            self.evict(coord, SaveMode::Queued);
        }
    }

    /// Removes `coord` from memory if nothing needs it, saving its data.
    ///
    /// A chunk holding stranded occupants is only evicted once they all
    /// serialize; until then it stays resident and goes back to the cache.
    pub(super) fn evict(&self, coord: ChunkCoord, mode: SaveMode) -> bool {
        let Some(chunk) = self.get_chunk(coord) else {
            return false;
        };
        let (job, was_loaded) = {
            let _transition = chunk.lock_transition();
            if chunk.is_retired() {
                return false;
            }
            {
                let sets = self.sets.read();
                if sets.active.contains(&coord) || sets.preloaded.contains(&coord) {
                    return false;
                }
            }
            match chunk.state() {
                ChunkState::Loading | ChunkState::Active => return false,
                ChunkState::Preloaded | ChunkState::Unloaded => {}
            }
            if !self.settle_stranded(&chunk) {
                return false;
            }

            let snapshot = chunk.take_snapshot();
            let was_loaded = snapshot.tiles.is_some();
            chunk.index().clear();
            // Staged before the chunk leaves the table so a reload finds it.
            let job = self.stage_eviction(snapshot);
            chunk.set_state(ChunkState::Unloaded);
            chunk.retire();
            self.chunks.write().remove(&coord);
            self.cache.lock().remove(&coord);
            (job, was_loaded)
        };

        if let Some(job) = job {
            self.dispatch_save(job, mode);
        }

        Counters::bump(&self.counters.evictions);
        debug!(%coord, "chunk evicted");
        if was_loaded {
            self.deps.sink.chunk_unloaded(ChunkUnloaded {
                coord,
                layer: self.layer,
            });
        }
        true
    }

    /// Retries serializing `chunk`'s stranded occupants, buffering and
    /// despawning those that succeed. Returns `false`, with the chunk parked
    /// in the cache again, if any are still stranded. Caller holds the
    /// chunk's transition lock.
    fn settle_stranded(&self, chunk: &Chunk) -> bool {
        let stranded = chunk.take_stranded();
        if stranded.is_empty() {
            return true;
        }
        let coord = chunk.coord();
        let (captured, stuck) = self.capture(coord, stranded);
        for occupant in &captured {
            self.deps.factory.despawn(occupant.handle);
        }
        chunk.append_buffered(captured.into_iter().map(|c| c.record).collect());
        if stuck.is_empty() {
            return true;
        }

        warn!(%coord, stranded = stuck.len(), "chunk kept resident for unserializable occupants");
        chunk.append_stranded(stuck);
        let now = self.deps.clock.now();
        self.cache.lock().park(coord, now);
        false
    }

    /// Records an evicted snapshot as pending and builds its save job.
    ///
    /// An older snapshot of the same chunk that is still unsaved is merged
    /// underneath rather than replaced, and the merged result gets a fresh
    /// ticket so writes of the older one become stale.
    fn stage_eviction(&self, snapshot: ChunkSnapshot) -> Option<SaveJob> {
        let coord = snapshot.coord;
        let snapshot = match self.pending_saves.remove(&coord) {
            Some((_, older)) => {
                debug!(%coord, "merging eviction into unsaved snapshot");
                snapshot.merged_over(&older.snapshot)
            }
            None => snapshot,
        };
        if snapshot.is_empty() {
            return None;
        }

        let snapshot = Arc::new(snapshot);
        let ticket = self.ledger.issue(&snapshot);
        self.pending_saves.insert(
            coord,
            PendingSave {
                snapshot: Arc::clone(&snapshot),
                ticket: Arc::clone(&ticket),
                failed: false,
            },
        );
        Some(SaveJob {
            snapshot,
            ticket,
            origin: SaveOrigin::Eviction,
        })
    }

    /// Evicts expired cache entries and requeues failed saves. Returns the
    /// number of chunks evicted.
    pub(super) fn sweep(&self) -> usize {
        let expired = {
            let now = self.deps.clock.now();
            self.cache.lock().expire(now)
        };
        let mode = if self.is_shutting_down() {
            SaveMode::Inline
        } else {
            SaveMode::Queued
        };
        let evicted = expired.into_iter().filter(|&coord| self.evict(coord, mode)).count();
        self.retry_pending_saves(false, mode);
        evicted
    }

    pub(super) fn dispatch_save(&self, job: SaveJob, mode: SaveMode) {
        match mode {
            SaveMode::Inline => self.run_save(job),
            SaveMode::Queued => {
                let coord = job.snapshot.coord;
                if self.save_queue.submit_or_run(job, |job| self.run_save(job)) == SaveDispatch::Inline {
                    Counters::bump(&self.counters.saves_inline);
                    warn!(%coord, "save queue full; saved on the calling thread");
                }
            }
        }
    }

    /// Writes a snapshot on the save IO pool. Tiles are skipped for
    /// degraded chunks so placeholder data never overwrites storage. Each
    /// key is checked against the ledger right before its write, so a call
    /// that outlived its deadline cannot overwrite newer data.
    pub(super) fn run_save(&self, job: SaveJob) {
        let snapshot = Arc::clone(&job.snapshot);
        let coord = snapshot.coord;
        if snapshot.tiles.is_some() && snapshot.degraded {
            warn!(%coord, "chunk loaded degraded; not writing its tiles");
        }

        let store = Arc::clone(&self.deps.store);
        let region = self.config.region.clone();
        let ticket = Arc::clone(&job.ticket);
        let result = self.save_io.call(move || {
            if snapshot.writes_tiles()
                && let Some(tiles) = &snapshot.tiles
                && ticket.claim(&WriteKey::Tiles(snapshot.coord))
            {
                store.upsert_chunk_tiles(&region, snapshot.coord, snapshot.layer, tiles, snapshot.last_tick)?;
            }
            for record in &snapshot.occupants {
                if ticket.claim(&WriteKey::Occupant(record.id)) {
                    store.upsert_occupant(&region, record)?;
                }
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                if job.origin == SaveOrigin::Eviction {
                    self.pending_saves
                        .remove_if(&coord, |_, pending| Arc::ptr_eq(&pending.snapshot, &job.snapshot));
                }
                Counters::bump(&self.counters.saves_completed);
                debug!(%coord, occupants = job.snapshot.occupants.len(), "chunk saved");
            }
            Err(err) => {
                match job.origin {
                    SaveOrigin::Eviction => {
                        error!(%coord, "chunk save failed; will retry: {err}");
                        if let Some(mut pending) = self.pending_saves.get_mut(&coord)
                            && Arc::ptr_eq(&pending.snapshot, &job.snapshot)
                        {
                            pending.failed = true;
                        }
                    }
                    SaveOrigin::Checkpoint => {
                        error!(%coord, "chunk checkpoint failed: {err}");
                    }
                }
                Counters::bump(&self.counters.saves_failed);
            }
        }
    }

    /// Re-dispatches pending eviction saves: failed ones, or all of them
    /// when `include_unstarted` is set.
    pub(super) fn retry_pending_saves(&self, include_unstarted: bool, mode: SaveMode) {
        let retry: Vec<(ChunkCoord, Arc<ChunkSnapshot>, Arc<_>)> = self
            .pending_saves
            .iter()
            .filter(|entry| include_unstarted || entry.failed)
            .map(|entry| (*entry.key(), Arc::clone(&entry.snapshot), Arc::clone(&entry.ticket)))
            .collect();

        for (coord, snapshot, ticket) in retry {
            if let Some(mut pending) = self.pending_saves.get_mut(&coord) {
                if !Arc::ptr_eq(&pending.snapshot, &snapshot) {
                    continue;
                }
                pending.failed = false;
            } else {
                continue;
            }
            debug!(%coord, "retrying chunk save");
            self.dispatch_save(
                SaveJob {
                    snapshot,
                    ticket,
                    origin: SaveOrigin::Eviction,
                },
                mode,
            );
        }
    }
}
