//! File-backed raw chunk source. Serves pre-captured raw frames (BGRA
//! pictures or packed s16 sample blocks) from a flat file, chunk by chunk,
//! with byte-accurate seeking. Selected through the reserved `file:` device
//! prefix.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tracing::{debug, info};

use crate::{DeviceInfo, GrabInfo, MediaKind, MediaSource, Result, SourceError};

pub const FILE_DEVICE_PREFIX: &str = "file:";

enum OpenState {
    Closed,
    Video { width: u32, height: u32 },
    Audio { channels: u8 },
}

pub struct FileSource {
    path: PathBuf,
    file: Option<File>,
    state: OpenState,
    frame_rate: f32,
    sample_rate: u32,
    /// samples per channel per grabbed audio chunk
    samples_per_chunk: usize,
    total_len: u64,
    stopped: bool,
    filters: Vec<String>,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
            state: OpenState::Closed,
            frame_rate: 25.0,
            sample_rate: 44_100,
            samples_per_chunk: 1024,
            total_len: 0,
            stopped: false,
            filters: Vec::new(),
        }
    }

    /// Device name this source answers to.
    pub fn device_name(&self) -> String {
        format!("{FILE_DEVICE_PREFIX}{}", self.path.display())
    }

    fn chunk_len(&self) -> usize {
        match self.state {
            OpenState::Closed => 0,
            OpenState::Video { width, height } => width as usize * height as usize * 4,
            OpenState::Audio { channels } => self.samples_per_chunk * 2 * usize::from(channels),
        }
    }

    /// Bytes the file advances by per second of media.
    fn bytes_per_second(&self) -> f64 {
        match self.state {
            OpenState::Closed => 0.0,
            OpenState::Video { .. } => self.chunk_len() as f64 * f64::from(self.frame_rate),
            OpenState::Audio { channels } => {
                f64::from(self.sample_rate) * 2.0 * f64::from(channels)
            }
        }
    }

    fn open_file(&mut self) -> Result<()> {
        let file = File::open(&self.path)?;
        self.total_len = file.metadata()?.len();
        self.file = Some(file);
        info!(path = %self.path.display(), len = self.total_len, "opened file source");
        Ok(())
    }
}

impl MediaSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    fn open_video(&mut self, width: u32, height: u32, fps: f32) -> Result<()> {
        self.state = OpenState::Video { width, height };
        self.frame_rate = fps;
        self.open_file()
    }

    fn open_audio(&mut self, sample_rate: u32, channels: u8) -> Result<()> {
        self.state = OpenState::Audio { channels };
        self.sample_rate = sample_rate;
        self.open_file()
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        self.state = OpenState::Closed;
        self.stopped = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn grab_chunk(&mut self, buf: &mut BytesMut, _drop: bool) -> Result<GrabInfo> {
        if self.stopped {
            return Err(SourceError::Stopped);
        }
        let chunk_len = self.chunk_len();
        let file = self.file.as_mut().ok_or(SourceError::NotOpen)?;

        buf.resize(chunk_len, 0);
        let mut read = 0;
        while read < chunk_len {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        if read == 0 {
            return Err(SourceError::EndOfStream);
        }
        buf.truncate(read);
        debug!(bytes = read, "grabbed file chunk");

        Ok(GrabInfo {
            size: read,
            captured_at_us: crate::monotonic_us(),
            wall_clock_us: crate::wall_clock_us(),
        })
    }

    fn frame_rate(&self) -> f32 {
        match self.state {
            OpenState::Audio { .. } => {
                self.sample_rate as f32 / self.samples_per_chunk as f32
            }
            _ => self.frame_rate,
        }
    }

    fn set_frame_rate(&mut self, fps: f32) {
        self.frame_rate = fps;
    }

    fn resolution(&self) -> (u32, u32) {
        match self.state {
            OpenState::Video { width, height } => (width, height),
            _ => (0, 0),
        }
    }

    fn set_resolution(&mut self, width: u32, height: u32) {
        if let OpenState::Video { .. } = self.state {
            self.state = OpenState::Video { width, height };
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u8 {
        match self.state {
            OpenState::Audio { channels } => channels,
            _ => 0,
        }
    }

    fn supports_seeking(&self) -> bool {
        true
    }

    fn seek(&mut self, seconds: f32) -> Result<()> {
        let bps = self.bytes_per_second();
        let chunk_len = self.chunk_len().max(1) as u64;
        let file = self.file.as_mut().ok_or(SourceError::NotOpen)?;
        // align to a chunk boundary so pictures stay intact
        let target = ((f64::from(seconds) * bps) as u64 / chunk_len) * chunk_len;
        file.seek(SeekFrom::Start(target.min(self.total_len)))?;
        debug!(seconds, target, "seeked file source");
        Ok(())
    }

    fn seek_pos(&self) -> f32 {
        let bps = self.bytes_per_second();
        if bps <= 0.0 {
            return 0.0;
        }
        let pos = self
            .file
            .as_ref()
            .and_then(|f| f.stream_position_hint())
            .unwrap_or(0);
        (pos as f64 / bps) as f32
    }

    fn seek_end(&self) -> f32 {
        let bps = self.bytes_per_second();
        if bps <= 0.0 {
            return 0.0;
        }
        (self.total_len as f64 / bps) as f32
    }

    fn time_shift(&mut self, offset_us: i64) -> Result<()> {
        let pos = self.seek_pos();
        self.seek(pos + offset_us as f32 / 1_000_000.0)
    }

    fn accepts_device(&mut self, device: &str, _kind: MediaKind) -> bool {
        device == self.device_name()
    }

    fn devices(&self, kind: MediaKind) -> Vec<DeviceInfo> {
        vec![DeviceInfo {
            name: self.device_name(),
            description: "file-backed raw source".into(),
            kind,
        }]
    }

    fn current_device(&self) -> String {
        self.device_name()
    }

    fn stop_grabbing(&mut self) {
        self.stopped = true;
    }

    fn is_grabbing_stopped(&self) -> bool {
        self.stopped
    }

    fn is_file_backed(&self) -> bool {
        true
    }

    fn take_filters(&mut self) -> Vec<String> {
        std::mem::take(&mut self.filters)
    }

    fn add_filters(&mut self, mut filters: Vec<String>) {
        self.filters.append(&mut filters);
    }
}

trait StreamPositionHint {
    fn stream_position_hint(&self) -> Option<u64>;
}

impl StreamPositionHint for File {
    fn stream_position_hint(&self) -> Option<u64> {
        // Seek requires &mut; a cloned handle shares the cursor
        self.try_clone()
            .ok()
            .and_then(|mut f| f.stream_position().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_file(bytes: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
        f.write_all(&data).unwrap();
        f
    }

    #[test]
    fn grabs_fixed_size_video_chunks() {
        let f = sample_file(8 * 8 * 4 * 3);
        let mut src = FileSource::new(f.path());
        src.open_video(8, 8, 25.0).unwrap();

        let mut buf = BytesMut::new();
        for _ in 0..3 {
            let info = src.grab_chunk(&mut buf, false).unwrap();
            assert_eq!(info.size, 8 * 8 * 4);
        }
        assert!(matches!(
            src.grab_chunk(&mut buf, false),
            Err(SourceError::EndOfStream)
        ));
    }

    #[test]
    fn seek_realigns_to_chunk_boundary() {
        let f = sample_file(8 * 8 * 4 * 10);
        let mut src = FileSource::new(f.path());
        src.open_video(8, 8, 10.0).unwrap();

        src.seek(0.25).unwrap();
        let mut buf = BytesMut::new();
        let info = src.grab_chunk(&mut buf, false).unwrap();
        assert_eq!(info.size, 8 * 8 * 4);
        // 0.25 s at 10 fps = 2.5 frames, aligned down to frame 2
        assert_eq!(buf[0], ((2 * 8 * 8 * 4) % 251) as u8);
    }

    #[test]
    fn stop_grabbing_latches() {
        let f = sample_file(1024);
        let mut src = FileSource::new(f.path());
        src.open_audio(8_000, 1).unwrap();
        src.stop_grabbing();
        let mut buf = BytesMut::new();
        assert!(matches!(
            src.grab_chunk(&mut buf, false),
            Err(SourceError::Stopped)
        ));
        // closing clears the latch
        src.close().unwrap();
        assert!(!src.is_grabbing_stopped());
    }

    #[test]
    fn answers_to_its_file_device_name() {
        let f = sample_file(16);
        let mut src = FileSource::new(f.path());
        let name = src.device_name();
        assert!(src.accepts_device(&name, MediaKind::Video));
        assert!(!src.accepts_device("camera0", MediaKind::Video));
    }
}
