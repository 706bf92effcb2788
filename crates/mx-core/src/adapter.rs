//! Channel adapters between grabbed chunks and codec frames.
//!
//! Capture devices deliver whatever geometry and sample layout they have;
//! codecs consume fixed frames. [`VideoAdapter`] rescales pictures,
//! [`SampleAdapter`] buffers, resamples and regroups audio so the encoder
//! always sees frames of exactly `frame_size()` samples per channel.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::warn;

/// Nearest-neighbor BGRA rescaler.
pub struct VideoAdapter {
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
}

impl VideoAdapter {
    pub fn new(src_width: u32, src_height: u32, dst_width: u32, dst_height: u32) -> Self {
        Self {
            src_width,
            src_height,
            dst_width,
            dst_height,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.src_width == self.dst_width && self.src_height == self.dst_height
    }

    /// Rescale one picture. Short input, as a truncated final file chunk,
    /// yields `None` instead of a partial picture.
    pub fn convert(&self, src: &Bytes) -> Option<Bytes> {
        let (sw, sh) = (self.src_width as usize, self.src_height as usize);
        if src.len() < sw * sh * 4 {
            warn!(
                bytes = src.len(),
                expected = sw * sh * 4,
                "dropping short picture"
            );
            return None;
        }
        if self.is_passthrough() {
            return Some(src.clone());
        }
        let (dw, dh) = (self.dst_width as usize, self.dst_height as usize);
        let mut dst = BytesMut::with_capacity(dw * dh * 4);
        for y in 0..dh {
            let sy = (y * sh / dh).min(sh - 1);
            for x in 0..dw {
                let sx = (x * sw / dw).min(sw - 1);
                let idx = (sy * sw + sx) * 4;
                dst.extend_from_slice(&src[idx..idx + 4]);
            }
        }
        Some(dst.freeze())
    }
}

/// Per-channel elastic sample buffers. Input is packed s16; output frames
/// come out packed or planar depending on what the codec consumes.
pub struct SampleAdapter {
    rings: Vec<VecDeque<u8>>,
    src_rate: u32,
    dst_rate: u32,
    src_channels: usize,
    frame_samples: usize,
    planar: bool,
}

impl SampleAdapter {
    pub fn new(
        src_rate: u32,
        src_channels: u8,
        dst_rate: u32,
        dst_channels: u8,
        frame_samples: usize,
        planar: bool,
    ) -> Self {
        Self {
            rings: (0..dst_channels).map(|_| VecDeque::new()).collect(),
            src_rate,
            dst_rate,
            src_channels: usize::from(src_channels).max(1),
            frame_samples,
            planar,
        }
    }

    /// Feed one packed s16 chunk in the source layout. Nearest-sample rate
    /// conversion; missing channels are duplicated from the last one.
    pub fn push(&mut self, packed: &[u8]) {
        let in_samples = packed.len() / (2 * self.src_channels);
        if in_samples == 0 {
            return;
        }
        let out_samples =
            (in_samples as u64 * u64::from(self.dst_rate) / u64::from(self.src_rate)) as usize;
        for j in 0..out_samples {
            let si = (j as u64 * u64::from(self.src_rate) / u64::from(self.dst_rate)) as usize;
            for (c, ring) in self.rings.iter_mut().enumerate() {
                let sc = c.min(self.src_channels - 1);
                let idx = (si * self.src_channels + sc) * 2;
                ring.push_back(packed[idx]);
                ring.push_back(packed[idx + 1]);
            }
        }
    }

    /// Take one full codec frame if enough samples are buffered.
    pub fn pop_frame(&mut self) -> Option<Bytes> {
        let frame_bytes = self.frame_samples * 2;
        if self.rings.iter().any(|ring| ring.len() < frame_bytes) {
            return None;
        }
        let mut out = BytesMut::with_capacity(frame_bytes * self.rings.len());
        if self.planar {
            for ring in &mut self.rings {
                for _ in 0..frame_bytes {
                    out.extend_from_slice(&[pop_byte(ring)]);
                }
            }
        } else {
            for _ in 0..self.frame_samples {
                for ring in &mut self.rings {
                    let lo = pop_byte(ring);
                    let hi = pop_byte(ring);
                    out.extend_from_slice(&[lo, hi]);
                }
            }
        }
        Some(out.freeze())
    }

    /// Samples per channel still waiting for a full frame.
    pub fn buffered_samples(&self) -> usize {
        self.rings.first().map_or(0, |ring| ring.len() / 2)
    }

    pub fn clear(&mut self) {
        for ring in &mut self.rings {
            ring.clear();
        }
    }
}

fn pop_byte(ring: &mut VecDeque<u8>) -> u8 {
    ring.pop_front().unwrap_or(0)
}

/// Every s16 sample in the buffer stays below the threshold.
pub fn is_silence(samples: &[u8], threshold: i16) -> bool {
    samples
        .chunks_exact(2)
        .all(|pair| i16::from_le_bytes([pair[0], pair[1]]).unsigned_abs() < threshold.unsigned_abs())
}
