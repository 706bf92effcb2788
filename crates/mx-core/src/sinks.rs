//! Packet fan-out. Sinks register with the muxer and receive every relayed
//! packet plus periodic sync points tying stream timestamps back to capture
//! time.

use std::sync::Arc;

use async_trait::async_trait;
use mx_codec::EncodedPacket;
use tokio::sync::{Mutex, RwLock};
use tracing::trace;

/// A consumer of relayed packets.
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn on_packet(&self, packet: &EncodedPacket);

    /// A synchronization point: the capture time of the media that the
    /// given presentation timestamp refers to.
    async fn on_sync_point(&self, captured_at_us: u64, presentation_ts: i64) {
        let _ = (captured_at_us, presentation_ts);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PacketStats {
    pub packets: u64,
    pub bytes: u64,
    pub min_size: usize,
    pub max_size: usize,
}

impl PacketStats {
    fn record(&mut self, size: usize) {
        if self.packets == 0 || size < self.min_size {
            self.min_size = size;
        }
        if size > self.max_size {
            self.max_size = size;
        }
        self.packets += 1;
        self.bytes += size as u64;
    }

    pub fn avg_size(&self) -> usize {
        if self.packets == 0 {
            0
        } else {
            (self.bytes / self.packets) as usize
        }
    }
}

/// The registered sinks of one muxer, shared between the public API and
/// the encoding task.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Arc<Mutex<Vec<Arc<dyn MediaSink>>>>,
    stats: Arc<RwLock<PacketStats>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, sink: Arc<dyn MediaSink>) {
        self.sinks.lock().await.push(sink);
    }

    /// Remove a previously registered sink. Identity is the `Arc`, not the
    /// contents.
    pub async fn remove(&self, sink: &Arc<dyn MediaSink>) -> bool {
        let mut sinks = self.sinks.lock().await;
        let before = sinks.len();
        sinks.retain(|s| !Arc::ptr_eq(s, sink));
        sinks.len() != before
    }

    pub async fn count(&self) -> usize {
        self.sinks.lock().await.len()
    }

    pub async fn relay_packet(&self, packet: &EncodedPacket) {
        self.stats.write().await.record(packet.size());
        let sinks = self.sinks.lock().await.clone();
        trace!(bytes = packet.size(), sinks = sinks.len(), "relaying packet");
        for sink in &sinks {
            sink.on_packet(packet).await;
        }
    }

    pub async fn relay_sync(&self, captured_at_us: u64, presentation_ts: i64) {
        let sinks = self.sinks.lock().await.clone();
        for sink in &sinks {
            sink.on_sync_point(captured_at_us, presentation_ts).await;
        }
    }

    pub async fn stats(&self) -> PacketStats {
        *self.stats.read().await
    }

    pub async fn reset_stats(&self) {
        *self.stats.write().await = PacketStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mx_codec::CodecId;

    struct Collecting {
        packets: Mutex<Vec<EncodedPacket>>,
    }

    #[async_trait]
    impl MediaSink for Collecting {
        async fn on_packet(&self, packet: &EncodedPacket) {
            self.packets.lock().await.push(packet.clone());
        }
    }

    fn packet(len: usize) -> EncodedPacket {
        EncodedPacket {
            data: Bytes::from(vec![0u8; len]),
            pts: 0,
            is_keyframe: false,
            codec: CodecId::H264,
        }
    }

    #[tokio::test]
    async fn packets_reach_every_sink() {
        let set = SinkSet::new();
        let a = Arc::new(Collecting {
            packets: Mutex::new(Vec::new()),
        });
        let b = Arc::new(Collecting {
            packets: Mutex::new(Vec::new()),
        });
        set.add(a.clone()).await;
        set.add(b.clone()).await;

        set.relay_packet(&packet(10)).await;
        assert_eq!(a.packets.lock().await.len(), 1);
        assert_eq!(b.packets.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn removal_uses_arc_identity() {
        let set = SinkSet::new();
        let a: Arc<dyn MediaSink> = Arc::new(Collecting {
            packets: Mutex::new(Vec::new()),
        });
        let b: Arc<dyn MediaSink> = Arc::new(Collecting {
            packets: Mutex::new(Vec::new()),
        });
        set.add(a.clone()).await;
        assert!(!set.remove(&b).await);
        assert!(set.remove(&a).await);
        assert_eq!(set.count().await, 0);
    }

    #[tokio::test]
    async fn stats_track_sizes() {
        let set = SinkSet::new();
        set.relay_packet(&packet(10)).await;
        set.relay_packet(&packet(30)).await;
        let stats = set.stats().await;
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.bytes, 40);
        assert_eq!(stats.min_size, 10);
        assert_eq!(stats.max_size, 30);
        assert_eq!(stats.avg_size(), 20);
    }

    #[tokio::test]
    async fn reset_clears_the_counters() {
        let set = SinkSet::new();
        set.relay_packet(&packet(10)).await;
        set.reset_stats().await;
        let stats = set.stats().await;
        assert_eq!(stats.packets, 0);
        assert_eq!(stats.bytes, 0);
        assert_eq!(stats.avg_size(), 0);
    }
}
