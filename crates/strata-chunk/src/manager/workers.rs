//! Background threads: the load pool, the save pool and the janitor.
//!
//! Every thread owns a clone of the stop receiver. The manager stops them by
//! dropping the only sender, which makes the stop arm of each `select!`
//! ready. Jobs still queued at that point are abandoned; shutdown writes
//! their data synchronously.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, select};
use tracing::{debug, error, warn};

use super::Inner;
use super::stats::Counters;
use crate::chunk::ChunkState;
use crate::coord::ChunkCoord;
use crate::events::ChunkLoaded;
use crate::occupant::OccupantRecord;
use crate::queue::LoadJob;
use crate::store::StorageError;

/// Starts every thread, pushing handles as they are spawned so a failure
/// part-way can still be joined.
pub(super) fn spawn_all(
    inner: &Arc<Inner>,
    stop: &Receiver<()>,
    handles: &mut Vec<JoinHandle<()>>,
) -> std::io::Result<()> {
    for id in 0..inner.config.load_workers.max(1) {
        let inner = Arc::clone(inner);
        let jobs = inner.load_queue.receiver();
        let stop = stop.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("chunk-load-{id}"))
                .spawn(move || loop {
                    select! {
                        recv(stop) -> _ => break,
                        recv(jobs) -> job => match job {
                            Ok(job) => inner.run_load(job),
                            Err(_) => break,
                        },
                    }
                })?,
        );
    }

    for id in 0..inner.config.save_workers.max(1) {
        let inner = Arc::clone(inner);
        let jobs = inner.save_queue.receiver();
        let stop = stop.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("chunk-save-{id}"))
                .spawn(move || loop {
                    select! {
                        recv(stop) -> _ => break,
                        recv(jobs) -> job => match job {
                            Ok(job) => inner.run_save(job),
                            Err(_) => break,
                        },
                    }
                })?,
        );
    }

    let interval = inner.config.sweep_interval;
    if !interval.is_zero() {
        let inner = Arc::clone(inner);
        let stop = stop.clone();
        handles.push(
            std::thread::Builder::new()
                .name("chunk-janitor".into())
                .spawn(move || loop {
                    select! {
                        recv(stop) -> _ => break,
                        default(interval) => {
                            let evicted = inner.sweep();
                            if evicted > 0 {
                                debug!(evicted, "janitor evicted expired chunks");
                            }
                        }
                    }
                })?,
        );
    }
    Ok(())
}

/// Data fetched for one chunk.
struct Fetched {
    tiles: Vec<u8>,
    last_tick: u64,
    occupants: Vec<OccupantRecord>,
    degraded: bool,
}

impl Inner {
    /// Loads one chunk and installs the result.
    ///
    /// Storage errors produce a degraded chunk with zeroed tiles. A timeout
    /// or a saturated IO pool abandons the load and returns the chunk to
    /// `Unloaded`, parked in the eviction cache unless the zone wants it.
    pub(super) fn run_load(&self, job: LoadJob) {
        let chunk = job.chunk;
        let coord = chunk.coord();
        if chunk.is_retired() || chunk.state() != ChunkState::Loading {
            return;
        }

        // An evicted snapshot that has not reached storage is newer than
        // anything storage holds.
        let unsaved = self.pending_saves.remove(&coord).map(|(_, pending)| pending.snapshot);
        let fetched = match unsaved {
            Some(snapshot) if snapshot.tiles.is_some() => {
                debug!(%coord, "loading chunk from unsaved snapshot");
                Ok(Fetched {
                    tiles: snapshot.tiles.clone().unwrap_or_default(),
                    last_tick: snapshot.last_tick,
                    occupants: snapshot.occupants.clone(),
                    degraded: snapshot.degraded,
                })
            }
            Some(snapshot) => {
                // Only occupants that migrated into a never-loaded chunk;
                // they rejoin the buffer and win over storage on merge.
                chunk.append_buffered(snapshot.occupants.clone());
                self.fetch(coord, chunk.tile_count())
            }
            None => self.fetch(coord, chunk.tile_count()),
        };

        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(%coord, "abandoning chunk load: {err}");
                let overflow = {
                    let _transition = chunk.lock_transition();
                    if chunk.is_retired() || chunk.state() != ChunkState::Loading {
                        Vec::new()
                    } else {
                        let overflow = self.park_unloaded(coord);
                        chunk.set_state(ChunkState::Unloaded);
                        overflow
                    }
                };
                Counters::bump(&self.counters.loads_timed_out);
                self.evict_overflow(overflow);
                return;
            }
        };

        let transition = chunk.lock_transition();
        if chunk.is_retired() || chunk.state() != ChunkState::Loading {
            return;
        }
        let degraded = fetched.degraded;
        let tiles = fetched.tiles.clone();
        let occupant_count =
            chunk.install_loaded(fetched.tiles, fetched.last_tick, fetched.occupants, degraded);
        Counters::bump(&self.counters.loads_completed);
        if degraded {
            Counters::bump(&self.counters.loads_degraded);
        }
        let overflow = self.file_preloaded(coord);
        chunk.set_state(ChunkState::Preloaded);
        drop(transition);

        debug!(
            %coord,
            occupants = occupant_count,
            waited_ms = job.enqueued_at.elapsed().as_millis() as u64,
            "chunk loaded"
        );

        self.deps.sink.chunk_loaded(ChunkLoaded {
            coord,
            layer: self.layer,
            tiles,
            occupant_count,
            degraded,
        });
        self.evict_overflow(overflow);
    }

    /// Reads tiles and occupants in one call on the load IO pool. Only a
    /// missed deadline, a saturated pool or a vanished call is an error;
    /// backend errors degrade the result.
    fn fetch(&self, coord: ChunkCoord, tile_count: usize) -> Result<Fetched, StorageError> {
        let store = Arc::clone(&self.deps.store);
        let region = self.config.region.clone();
        let layer = self.layer;
        let (tiles, occupants) = self.load_io.call(move || {
            let tiles = store.get_chunk_tiles(&region, coord, layer);
            let occupants = store.get_occupants_by_chunk(&region, coord, layer);
            Ok((tiles, occupants))
        })?;

        let mut degraded = false;
        let (tiles, last_tick) = match tiles {
            Ok(Some(mut stored)) => {
                if stored.tiles.len() != tile_count {
                    warn!(
                        %coord,
                        stored = stored.tiles.len(),
                        expected = tile_count,
                        "stored tile payload has the wrong size; resizing"
                    );
                    stored.tiles.resize(tile_count, 0);
                }
                (stored.tiles, stored.last_tick)
            }
            Ok(None) => (vec![0; tile_count], 0),
            Err(err) => {
                error!(%coord, "failed to read chunk tiles: {err}");
                degraded = true;
                (vec![0; tile_count], 0)
            }
        };
        let occupants = match occupants {
            Ok(occupants) => occupants,
            Err(err) => {
                error!(%coord, "failed to read chunk occupants: {err}");
                degraded = true;
                Vec::new()
            }
        };

        Ok(Fetched {
            tiles,
            last_tick,
            occupants,
            degraded,
        })
    }
}
