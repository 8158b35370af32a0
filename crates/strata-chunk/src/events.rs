//! Load/unload notifications for downstream consumers.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::coord::{ChunkCoord, LayerId};

/// Published once a chunk's data has been loaded.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkLoaded {
    pub coord: ChunkCoord,
    pub layer: LayerId,
    /// Tile payload as installed in the chunk.
    pub tiles: Vec<u8>,
    /// Buffered occupants after merging storage and early arrivals.
    pub occupant_count: usize,
    /// Storage failed during the load; tiles are zeroed placeholders.
    pub degraded: bool,
}

/// Published when a chunk is evicted from memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkUnloaded {
    pub coord: ChunkCoord,
    pub layer: LayerId,
}

/// Receives lifecycle notifications. Called from worker threads.
pub trait ChunkEventSink: Send + Sync {
    fn chunk_loaded(&self, event: ChunkLoaded);

    fn chunk_unloaded(&self, event: ChunkUnloaded);
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ChunkEventSink for NullSink {
    fn chunk_loaded(&self, _event: ChunkLoaded) {}

    fn chunk_unloaded(&self, _event: ChunkUnloaded) {}
}

/// A notification as delivered through a [`ChannelSink`].
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkEvent {
    Loaded(ChunkLoaded),
    Unloaded(ChunkUnloaded),
}

/// Forwards notifications into a bounded channel.
///
/// Sends never block: when the consumer falls behind the event is dropped
/// with a warning.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<ChunkEvent>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<ChunkEvent>) {
        let (sender, receiver) = bounded(capacity);
        (Self { sender }, receiver)
    }

    fn forward(&self, event: ChunkEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(?event, "chunk event channel full; dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl ChunkEventSink for ChannelSink {
    fn chunk_loaded(&self, event: ChunkLoaded) {
        self.forward(ChunkEvent::Loaded(event));
    }

    fn chunk_unloaded(&self, event: ChunkUnloaded) {
        self.forward(ChunkEvent::Unloaded(event));
    }
}
