//! Synthetic pattern source: moving gradient pictures or a sine tone,
//! generated on demand. Deterministic and clockless, which makes it the
//! workhorse for pipeline tests and demos.

use bytes::BytesMut;

use crate::{DeviceInfo, GrabInfo, MediaKind, MediaSource, Result, SourceError};

pub const PATTERN_DEVICE: &str = "pattern";

pub struct PatternSource {
    kind: MediaKind,
    device: String,
    open: bool,
    stopped: bool,
    width: u32,
    height: u32,
    frame_rate: f32,
    sample_rate: u32,
    channels: u8,
    samples_per_chunk: usize,
    /// emit pure zero samples instead of the tone
    silent: bool,
    variable_rate: bool,
    counter: u64,
    filters: Vec<String>,
}

impl PatternSource {
    pub fn video() -> Self {
        Self::new(MediaKind::Video)
    }

    pub fn audio() -> Self {
        Self::new(MediaKind::Audio)
    }

    fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            device: PATTERN_DEVICE.to_string(),
            open: false,
            stopped: false,
            width: 352,
            height: 288,
            frame_rate: 25.0,
            sample_rate: 44_100,
            channels: 2,
            samples_per_chunk: 960,
            silent: false,
            variable_rate: false,
            counter: 0,
            filters: Vec::new(),
        }
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device = name.into();
        self
    }

    pub fn with_samples_per_chunk(mut self, samples: usize) -> Self {
        self.samples_per_chunk = samples;
        self
    }

    pub fn with_silence(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn with_variable_frame_rate(mut self, variable: bool) -> Self {
        self.variable_rate = variable;
        self
    }

    pub fn set_silence(&mut self, silent: bool) {
        self.silent = silent;
    }

    fn fill_video(&self, buf: &mut BytesMut) {
        let (w, h) = (self.width as usize, self.height as usize);
        buf.resize(w * h * 4, 0);
        let phase = (self.counter % 256) as u8;
        for y in 0..h {
            for x in 0..w {
                let idx = (y * w + x) * 4;
                buf[idx] = (x % 256) as u8 ^ phase; // B
                buf[idx + 1] = (y % 256) as u8; // G
                buf[idx + 2] = phase; // R
                buf[idx + 3] = 0; // X
            }
        }
    }

    fn fill_audio(&self, buf: &mut BytesMut) {
        let samples = self.samples_per_chunk;
        let channels = usize::from(self.channels);
        buf.resize(samples * 2 * channels, 0);
        if self.silent {
            return;
        }
        let base = self.counter as usize * samples;
        for i in 0..samples {
            // 440 Hz-ish triangle, loud enough to never read as silence
            let t = (base + i) % 100;
            let value = ((t as i32 - 50) * 600) as i16;
            let le = value.to_le_bytes();
            for c in 0..channels {
                let idx = (i * channels + c) * 2;
                buf[idx] = le[0];
                buf[idx + 1] = le[1];
            }
        }
    }
}

impl MediaSource for PatternSource {
    fn name(&self) -> &str {
        "pattern"
    }

    fn open_video(&mut self, width: u32, height: u32, fps: f32) -> Result<()> {
        self.width = width;
        self.height = height;
        self.frame_rate = fps;
        self.open = true;
        self.counter = 0;
        Ok(())
    }

    fn open_audio(&mut self, sample_rate: u32, channels: u8) -> Result<()> {
        self.sample_rate = sample_rate;
        self.channels = channels;
        self.open = true;
        self.counter = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        self.stopped = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn grab_chunk(&mut self, buf: &mut BytesMut, _drop: bool) -> Result<GrabInfo> {
        if self.stopped {
            return Err(SourceError::Stopped);
        }
        if !self.open {
            return Err(SourceError::NotOpen);
        }
        match self.kind {
            MediaKind::Video => self.fill_video(buf),
            MediaKind::Audio => self.fill_audio(buf),
        }
        self.counter += 1;
        Ok(GrabInfo {
            size: buf.len(),
            captured_at_us: crate::monotonic_us(),
            wall_clock_us: crate::wall_clock_us(),
        })
    }

    fn frame_rate(&self) -> f32 {
        match self.kind {
            MediaKind::Video => self.frame_rate,
            MediaKind::Audio => self.sample_rate as f32 / self.samples_per_chunk as f32,
        }
    }

    fn set_frame_rate(&mut self, fps: f32) {
        self.frame_rate = fps;
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn set_resolution(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u8 {
        self.channels
    }

    fn has_variable_frame_rate(&self) -> bool {
        self.variable_rate
    }

    fn accepts_device(&mut self, device: &str, kind: MediaKind) -> bool {
        kind == self.kind && (device == self.device || device == "auto")
    }

    fn devices(&self, kind: MediaKind) -> Vec<DeviceInfo> {
        if kind != self.kind {
            return Vec::new();
        }
        vec![DeviceInfo {
            name: self.device.clone(),
            description: "synthetic pattern generator".into(),
            kind,
        }]
    }

    fn current_device(&self) -> String {
        self.device.clone()
    }

    fn stop_grabbing(&mut self) {
        self.stopped = true;
    }

    fn is_grabbing_stopped(&self) -> bool {
        self.stopped
    }

    fn take_filters(&mut self) -> Vec<String> {
        std::mem::take(&mut self.filters)
    }

    fn add_filters(&mut self, mut filters: Vec<String>) {
        self.filters.append(&mut filters);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_chunks_are_full_pictures() {
        let mut src = PatternSource::video();
        src.open_video(16, 16, 25.0).unwrap();
        let mut buf = BytesMut::new();
        let info = src.grab_chunk(&mut buf, false).unwrap();
        assert_eq!(info.size, 16 * 16 * 4);
    }

    #[test]
    fn consecutive_frames_differ() {
        let mut src = PatternSource::video();
        src.open_video(16, 16, 25.0).unwrap();
        let mut a = BytesMut::new();
        let mut b = BytesMut::new();
        src.grab_chunk(&mut a, false).unwrap();
        src.grab_chunk(&mut b, false).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn silent_audio_is_all_zero() {
        let mut src = PatternSource::audio().with_silence(true);
        src.open_audio(44_100, 2).unwrap();
        let mut buf = BytesMut::new();
        src.grab_chunk(&mut buf, false).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn tone_is_not_silence() {
        let mut src = PatternSource::audio();
        src.open_audio(44_100, 1).unwrap();
        let mut buf = BytesMut::new();
        src.grab_chunk(&mut buf, false).unwrap();
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn grab_before_open_fails() {
        let mut src = PatternSource::video();
        let mut buf = BytesMut::new();
        assert!(matches!(
            src.grab_chunk(&mut buf, false),
            Err(SourceError::NotOpen)
        ));
    }
}
