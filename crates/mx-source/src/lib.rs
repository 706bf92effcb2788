//! Base source contract: anything that can feed raw media chunks into the
//! relay. Capture devices, files and synthetic generators all sit behind
//! [`MediaSource`]; the relay core treats them as interchangeable.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod file;
pub mod pattern;

pub use file::FileSource;
pub use pattern::PatternSource;

pub type Result<T> = std::result::Result<T, SourceError>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("device not open")]
    NotOpen,

    #[error("grabbing stopped")]
    Stopped,

    #[error("end of stream")]
    EndOfStream,

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("capture failed: {0}")]
    CaptureFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Video,
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// Outcome of one successful grab: how much landed in the caller's buffer
/// and when it was captured on both clocks.
#[derive(Debug, Clone, Copy)]
pub struct GrabInfo {
    pub size: usize,
    /// Monotonic capture time, microseconds.
    pub captured_at_us: u64,
    /// NTP-style wall-clock capture time, microseconds since the epoch.
    pub wall_clock_us: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub description: String,
    pub kind: MediaKind,
}

/// Microseconds on the process-local monotonic clock.
pub fn monotonic_us() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Microseconds of wall-clock time since the Unix epoch.
pub fn wall_clock_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// A raw media provider. All methods are synchronous; blocking providers
/// belong on a blocking thread.
pub trait MediaSource: Send {
    /// Short implementation name, also used for registry identity.
    fn name(&self) -> &str;

    fn open_video(&mut self, width: u32, height: u32, fps: f32) -> Result<()>;
    fn open_audio(&mut self, sample_rate: u32, channels: u8) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn is_open(&self) -> bool;

    /// Fill `buf` with one raw chunk. With `drop` set the chunk is consumed
    /// from the device but the caller intends to discard it.
    fn grab_chunk(&mut self, buf: &mut BytesMut, drop: bool) -> Result<GrabInfo>;

    /// Native output frame rate the device delivers.
    fn frame_rate(&self) -> f32;
    fn set_frame_rate(&mut self, fps: f32);

    fn resolution(&self) -> (u32, u32);
    fn set_resolution(&mut self, width: u32, height: u32);

    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u8;

    /// The device cannot guarantee equidistant frames (e.g. change-driven
    /// capture); consumers must derive timing from capture timestamps.
    fn has_variable_frame_rate(&self) -> bool {
        false
    }

    fn supports_seeking(&self) -> bool {
        false
    }
    fn seek(&mut self, _seconds: f32) -> Result<()> {
        Err(SourceError::Unsupported("seek"))
    }
    fn seek_pos(&self) -> f32 {
        0.0
    }
    fn seek_end(&self) -> f32 {
        0.0
    }
    fn time_shift(&mut self, _offset_us: i64) -> Result<()> {
        Err(SourceError::Unsupported("time_shift"))
    }

    fn input_streams(&self) -> Vec<String> {
        Vec::new()
    }
    fn select_input_stream(&mut self, _index: usize) -> Result<()> {
        Err(SourceError::Unsupported("select_input_stream"))
    }
    fn has_input_stream_changed(&mut self) -> bool {
        false
    }

    /// Probe whether this provider can serve the named device.
    fn accepts_device(&mut self, device: &str, kind: MediaKind) -> bool;
    fn devices(&self, _kind: MediaKind) -> Vec<DeviceInfo> {
        Vec::new()
    }
    fn current_device(&self) -> String;

    fn stop_grabbing(&mut self);
    fn is_grabbing_stopped(&self) -> bool;

    /// Backed by a file rather than a live device; such sources are
    /// disposable once deselected.
    fn is_file_backed(&self) -> bool {
        false
    }

    /// Source-local filter registrations, handed over when the active
    /// source changes.
    fn take_filters(&mut self) -> Vec<String> {
        Vec::new()
    }
    fn add_filters(&mut self, _filters: Vec<String>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_us();
        let b = monotonic_us();
        assert!(b >= a);
    }

    #[test]
    fn wall_clock_is_plausible() {
        // sometime after 2020
        assert!(wall_clock_us() > 1_577_836_800_000_000);
    }
}
