//! Real-time transcoding relay core.
//!
//! A [`MediaMuxer`] pulls raw chunks from a registered [`MediaSource`],
//! shapes them on the grab path (flips, pointer marker, frame rate
//! throttle), queues them through a bounded FIFO and re-encodes them on a
//! dedicated task. Encoded packets fan out to every registered
//! [`MediaSink`] together with sync points that tie stream timestamps back
//! to capture time.
//!
//! Output format, quality, bit rate and packet sizing are negotiated
//! through [`PreferenceRequest`]; requests that name a codec without an
//! encoder are rejected wholesale.

pub mod adapter;
pub mod error;
pub mod fifo;
pub mod muxer;
pub mod prefs;
pub mod registry;
pub mod sinks;
pub mod throttle;
pub mod transform;

pub use error::{MuxerError, Result};
pub use muxer::{DEFAULT_SILENCE_THRESHOLD, MAX_FRAME_RATE, MIN_FRAME_RATE, MediaMuxer};
pub use prefs::{PreferenceRequest, StreamPreferences};
pub use registry::{AUTO_DEVICE, SourceRegistry};
pub use sinks::{MediaSink, PacketStats, SinkSet};

pub use mx_codec::{CodecId, EncodedPacket};
pub use mx_source::{MediaKind, MediaSource};
