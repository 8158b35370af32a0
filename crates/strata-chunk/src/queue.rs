//! Bounded job queues feeding the load and save pools.
//!
//! Both queues refuse to block the caller. A full load queue drops the job
//! and the caller reverts the chunk; a full save queue runs the job on the
//! calling thread instead, so no data is ever discarded.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::chunk::{Chunk, ChunkSnapshot};
use crate::ledger::WriteTicket;

/// A chunk waiting for its data.
#[derive(Debug)]
pub struct LoadJob {
    pub chunk: Arc<Chunk>,
    pub enqueued_at: Instant,
}

/// Why a save was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOrigin {
    /// The chunk left memory; the snapshot is its only copy.
    Eviction,
    /// The chunk is still resident.
    Checkpoint,
}

/// A detached snapshot waiting to be written.
#[derive(Debug, Clone)]
pub struct SaveJob {
    pub snapshot: Arc<ChunkSnapshot>,
    /// Issued when the snapshot was taken; a newer ticket makes this
    /// job's writes stale.
    pub ticket: Arc<WriteTicket>,
    pub origin: SaveOrigin,
}

/// How a save job was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveDispatch {
    Queued,
    Inline,
}

/// Bounded multi-producer queue of load jobs.
#[derive(Debug)]
pub struct LoadQueue {
    sender: Sender<LoadJob>,
    receiver: Receiver<LoadJob>,
}

impl LoadQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self { sender, receiver }
    }

    /// Enqueues without blocking. Returns the job back if the queue is full.
    pub fn offer(&self, job: LoadJob) -> Result<(), LoadJob> {
        match self.sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job) | TrySendError::Disconnected(job)) => Err(job),
        }
    }

    pub fn receiver(&self) -> Receiver<LoadJob> {
        self.receiver.clone()
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// Bounded multi-producer queue of save jobs.
#[derive(Debug)]
pub struct SaveQueue {
    sender: Sender<SaveJob>,
    receiver: Receiver<SaveJob>,
}

impl SaveQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self { sender, receiver }
    }

    /// Enqueues the job, or hands it to `run` on the calling thread when the
    /// queue is full.
    pub fn submit_or_run(&self, job: SaveJob, run: impl FnOnce(SaveJob)) -> SaveDispatch {
        match self.sender.try_send(job) {
            Ok(()) => SaveDispatch::Queued,
            Err(TrySendError::Full(job) | TrySendError::Disconnected(job)) => {
                run(job);
                SaveDispatch::Inline
            }
        }
    }

    pub fn receiver(&self) -> Receiver<SaveJob> {
        self.receiver.clone()
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}
