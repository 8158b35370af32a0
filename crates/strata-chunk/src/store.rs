//! Persistent storage seam.

use std::io;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use tracing::error;

use crate::coord::{ChunkCoord, LayerId};
use crate::occupant::OccupantRecord;

/// Tile payload and tick counter as persisted for one chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredTiles {
    /// Row-major tile bytes, `tile_grid_dim²` long.
    pub tiles: Vec<u8>,
    pub last_tick: u64,
}

/// Errors reported by a [`ChunkStore`] call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// The call did not complete within its deadline and was abandoned.
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend reported a failure.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Every thread of the named IO pool is busy and its queue is full.
    #[error("storage pool {0} is saturated")]
    Saturated(String),

    /// The call ended without producing a result.
    #[error("storage call ended without a result")]
    Disconnected,
}

/// Region/layer keyed chunk persistence.
///
/// Upserts must be idempotent: the manager retries failed saves with the
/// same data.
pub trait ChunkStore: Send + Sync + 'static {
    /// Tile payload for a chunk, `None` if it was never saved.
    fn get_chunk_tiles(
        &self,
        region: &str,
        coord: ChunkCoord,
        layer: LayerId,
    ) -> Result<Option<StoredTiles>, StorageError>;

    /// Every occupant record whose owning chunk is `coord`.
    fn get_occupants_by_chunk(
        &self,
        region: &str,
        coord: ChunkCoord,
        layer: LayerId,
    ) -> Result<Vec<OccupantRecord>, StorageError>;

    fn upsert_chunk_tiles(
        &self,
        region: &str,
        coord: ChunkCoord,
        layer: LayerId,
        tiles: &[u8],
        last_tick: u64,
    ) -> Result<(), StorageError>;

    /// Writes a record keyed by its id. A record that moved chunks replaces
    /// its old entry.
    fn upsert_occupant(&self, region: &str, record: &OccupantRecord) -> Result<(), StorageError>;
}

type IoTask = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of threads that run storage calls under a deadline.
///
/// The caller waits at most `timeout` for a call; a call that misses it
/// keeps its pool thread until it returns and its result is discarded. The
/// task queue is bounded, so a pool whose threads are all stuck behind a
/// slow backend rejects new calls with [`StorageError::Saturated`] instead
/// of growing. A zero timeout runs every call on the caller's thread and
/// starts no threads.
#[derive(Debug)]
pub struct IoPool {
    name: String,
    timeout: Duration,
    tasks: Mutex<Option<Sender<IoTask>>>,
}

impl IoPool {
    pub fn new(name: &str, threads: usize, capacity: usize, timeout: Duration) -> io::Result<Self> {
        if timeout.is_zero() {
            return Ok(Self {
                name: name.to_string(),
                timeout,
                tasks: Mutex::new(None),
            });
        }

        let (sender, receiver) = bounded::<IoTask>(capacity.max(1));
        for id in 0..threads.max(1) {
            let receiver = receiver.clone();
            let thread_name = format!("{name}-{id}");
            std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                            error!(thread = %thread_name, "storage call panicked");
                        }
                    }
                })?;
        }
        Ok(Self {
            name: name.to_string(),
            timeout,
            tasks: Mutex::new(Some(sender)),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `call` on a pool thread and waits for its result.
    pub fn call<T, F>(&self, call: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    {
        if self.timeout.is_zero() {
            return call();
        }

        let (tx, rx) = bounded(1);
        let task: IoTask = Box::new(move || {
            let _ = tx.send(call());
        });
        {
            let tasks = self.tasks.lock();
            let Some(sender) = tasks.as_ref() else {
                return Err(StorageError::Disconnected);
            };
            match sender.try_send(task) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => return Err(StorageError::Saturated(self.name.clone())),
                Err(TrySendError::Disconnected(_)) => return Err(StorageError::Disconnected),
            }
        }

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(StorageError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(StorageError::Disconnected),
        }
    }

    /// Stops accepting calls. Threads exit once the queued calls have run.
    pub fn close(&self) {
        self.tasks.lock().take();
    }
}
