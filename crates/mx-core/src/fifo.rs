//! Bounded chunk queue between the grab path and the encoding task.
//!
//! Control and data travel on the same queue: a [`FifoMessage::Shutdown`]
//! enqueued behind the last chunk lets the encoding task drain everything
//! already grabbed before it exits. The queue never blocks the grab side;
//! when it is full, new chunks are dropped at the door.

use bytes::Bytes;
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};
use tracing::warn;

/// Chunk capacity of the encoder input queue.
pub const INPUT_QUEUE_LIMIT: usize = 16;

/// Occupancy margin below the limit at which the queue is considered
/// congested and gets flushed.
pub const FLUSH_MARGIN: usize = 4;

/// One grabbed chunk on its way to the encoder.
#[derive(Debug, Clone)]
pub struct FifoEntry {
    pub data: Bytes,
    /// Monotonic capture time, microseconds.
    pub captured_at_us: u64,
    /// Wall-clock capture time, microseconds since the epoch.
    pub wall_clock_us: u64,
    pub seq: u64,
}

#[derive(Debug)]
pub enum FifoMessage {
    Chunk(FifoEntry),
    Shutdown,
}

pub struct EncoderFifo {
    inner: Mutex<VecDeque<FifoMessage>>,
    notify: Notify,
    capacity: usize,
}

impl EncoderFifo {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a message without ever blocking on a full queue. Returns
    /// false when a chunk was dropped. Shutdown always gets through.
    pub async fn push(&self, msg: FifoMessage) -> bool {
        let mut queue = self.inner.lock().await;
        if matches!(msg, FifoMessage::Chunk(_)) && chunk_count(&queue) >= self.capacity {
            warn!(capacity = self.capacity, "encoder input queue full, dropping chunk");
            return false;
        }
        queue.push_back(msg);
        drop(queue);
        self.notify.notify_one();
        true
    }

    /// Wait for the next message.
    pub async fn pop(&self) -> FifoMessage {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.inner.lock().await;
                if let Some(msg) = queue.pop_front() {
                    return msg;
                }
            }
            notified.await;
        }
    }

    /// Number of queued chunks. Control messages are not counted.
    pub async fn len(&self) -> usize {
        chunk_count(&*self.inner.lock().await)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all queued chunks, keeping control messages in place. Returns
    /// how many chunks were discarded.
    pub async fn clear(&self) -> usize {
        let mut queue = self.inner.lock().await;
        let before = queue.len();
        queue.retain(|msg| !matches!(msg, FifoMessage::Chunk(_)));
        before - queue.len()
    }

    /// The queue is close enough to its limit that the encoder has fallen
    /// behind.
    pub async fn near_capacity(&self) -> bool {
        self.len().await + FLUSH_MARGIN >= self.capacity
    }
}

fn chunk_count(queue: &VecDeque<FifoMessage>) -> usize {
    queue
        .iter()
        .filter(|msg| matches!(msg, FifoMessage::Chunk(_)))
        .count()
}
