//! Software encoder sessions.
//!
//! These are driving stand-ins, not real codecs: they consume frames at the
//! pace and granularity the contract demands and emit deterministic, tagged
//! bitstreams with realistic size behavior. Swap in a real binding behind
//! the same [`EncoderSession`] trait for production use.

use super::*;
use bytes::BytesMut;
use tracing::debug;

const VIDEO_MAGIC: &[u8; 4] = b"MXV0";
const AUDIO_MAGIC: &[u8; 4] = b"MXA0";

/// Stand-in video encoder: BGRA input, YUV 4:2:0 internally, per-macroblock
/// luma signature out. Keyframes carry the full signature, delta frames a
/// coarser one.
pub struct SoftwareVideoSession {
    descriptor: StreamDescriptor,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SoftwareVideoSession {
    pub fn open(descriptor: StreamDescriptor) -> Result<Self> {
        let StreamParams::Video { width, height, .. } = descriptor.params else {
            return Err(CodecError::InvalidConfig("video session needs video params".into()));
        };
        if width == 0 || height == 0 {
            return Err(CodecError::InvalidConfig(format!(
                "degenerate resolution {width}x{height}"
            )));
        }
        // the stand-ins only implement threaded encode for H.264/HEVC
        if descriptor.threaded && !matches!(descriptor.codec, CodecId::H264 | CodecId::Hevc) {
            return Err(CodecError::InitFailed(format!(
                "threaded encode not implemented for {}",
                descriptor.codec
            )));
        }
        Ok(Self {
            descriptor,
            width,
            height,
            frame_count: 0,
        })
    }

    fn bgra_to_yuv420(&self, bgra: &[u8]) -> Vec<u8> {
        let (width, height) = (self.width as usize, self.height as usize);
        let y_size = width * height;
        let uv_size = y_size / 4;
        let mut yuv = vec![0u8; y_size + uv_size * 2];

        for y in 0..height {
            for x in 0..width {
                let idx = (y * width + x) * 4;
                let b = f32::from(bgra[idx]);
                let g = f32::from(bgra[idx + 1]);
                let r = f32::from(bgra[idx + 2]);
                yuv[y * width + x] = (0.257 * r + 0.504 * g + 0.098 * b + 16.0) as u8;
            }
        }

        let u_offset = y_size;
        let v_offset = y_size + uv_size;
        for y in (0..height).step_by(2) {
            for x in (0..width).step_by(2) {
                let idx = (y * width + x) * 4;
                let b = f32::from(bgra[idx]);
                let g = f32::from(bgra[idx + 1]);
                let r = f32::from(bgra[idx + 2]);
                let uv_idx = (y / 2) * (width / 2) + x / 2;
                yuv[u_offset + uv_idx] = (-0.148 * r - 0.291 * g + 0.439 * b + 128.0) as u8;
                yuv[v_offset + uv_idx] = (0.439 * r - 0.368 * g - 0.071 * b + 128.0) as u8;
            }
        }

        yuv
    }

    fn macroblock_signature(&self, yuv: &[u8], step: usize) -> Vec<u8> {
        let (width, height) = (self.width as usize, self.height as usize);
        let mb_w = width.div_ceil(16);
        let mb_h = height.div_ceil(16);
        let mut sig = Vec::with_capacity(mb_w * mb_h / step + 1);
        for mb in (0..mb_w * mb_h).step_by(step) {
            let mx = (mb % mb_w) * 16;
            let my = (mb / mb_w) * 16;
            sig.push(yuv[my.min(height - 1) * width + mx.min(width - 1)]);
        }
        sig
    }
}

impl EncoderSession for SoftwareVideoSession {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<EncodedPacket>> {
        let expected = self.width as usize * self.height as usize * 4;
        if frame.data.len() != expected {
            return Err(CodecError::EncodingFailed(format!(
                "picture size {} does not match {}x{} BGRA ({expected})",
                frame.data.len(),
                self.width,
                self.height
            )));
        }

        let is_keyframe = self.frame_count % u64::from(self.descriptor.gop_size()) == 0;
        let yuv = self.bgra_to_yuv420(&frame.data);
        // keyframes sample every macroblock, delta frames every other one
        let signature = self.macroblock_signature(&yuv, if is_keyframe { 1 } else { 2 });

        let mut out = BytesMut::with_capacity(16 + signature.len());
        out.extend_from_slice(VIDEO_MAGIC);
        out.extend_from_slice(&[self.descriptor.codec as u8, u8::from(is_keyframe)]);
        out.extend_from_slice(&(self.descriptor.qmax() as u16).to_le_bytes());
        out.extend_from_slice(&frame.pts.to_le_bytes());
        out.extend_from_slice(&signature);

        debug!(
            frame = self.frame_count,
            bytes = out.len(),
            keyframe = is_keyframe,
            "encoded video frame"
        );

        self.frame_count += 1;
        Ok(vec![EncodedPacket {
            data: out.freeze(),
            pts: frame.pts,
            is_keyframe,
            codec: self.descriptor.codec,
        }])
    }

    fn flush(&mut self) -> Vec<EncodedPacket> {
        Vec::new()
    }

    fn frame_size(&self) -> usize {
        0
    }

    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }
}

/// Samples per channel each audio codec consumes per frame.
fn samples_per_frame(codec: CodecId) -> usize {
    match codec {
        CodecId::Mp3 => 1152,
        CodecId::G722 => 320,
        CodecId::PcmAlaw | CodecId::PcmMulaw | CodecId::Gsm => 160,
        _ => 1024,
    }
}

/// How aggressively the stand-in shrinks a frame: output bytes =
/// samples >> shift, sampling the high byte.
fn compression_shift(codec: CodecId) -> usize {
    match codec {
        CodecId::PcmAlaw | CodecId::PcmMulaw => 0,
        CodecId::G722 => 1,
        CodecId::Gsm => 2,
        CodecId::Mp3 => 2,
        _ => 0,
    }
}

/// Stand-in audio encoder: consumes packed (or planar) s16 frames of
/// exactly `frame_size()` samples per channel.
pub struct SoftwareAudioSession {
    descriptor: StreamDescriptor,
    channels: usize,
    frame_samples: usize,
    frame_count: u64,
}

impl SoftwareAudioSession {
    pub fn open(descriptor: StreamDescriptor) -> Result<Self> {
        let StreamParams::Audio { channels, .. } = descriptor.params else {
            return Err(CodecError::InvalidConfig("audio session needs audio params".into()));
        };
        if channels == 0 {
            return Err(CodecError::InvalidConfig("zero audio channels".into()));
        }
        Ok(Self {
            frame_samples: samples_per_frame(descriptor.codec),
            descriptor,
            channels: usize::from(channels),
            frame_count: 0,
        })
    }
}

impl EncoderSession for SoftwareAudioSession {
    fn encode(&mut self, frame: &Frame) -> Result<Vec<EncodedPacket>> {
        let expected = self.frame_samples * 2 * self.channels;
        if frame.data.len() != expected {
            return Err(CodecError::EncodingFailed(format!(
                "audio frame of {} bytes, codec consumes exactly {expected}",
                frame.data.len()
            )));
        }

        let shift = compression_shift(self.descriptor.codec);
        let step = 2 << shift;
        let mut out = BytesMut::with_capacity(16 + frame.data.len() / step);
        out.extend_from_slice(AUDIO_MAGIC);
        out.extend_from_slice(&[self.descriptor.codec as u8, self.channels as u8]);
        out.extend_from_slice(&(self.frame_samples as u16).to_le_bytes());
        out.extend_from_slice(&frame.pts.to_le_bytes());
        // high byte of every step-th s16 sample
        for chunk in frame.data.chunks_exact(step) {
            out.extend_from_slice(&[chunk[1]]);
        }

        self.frame_count += 1;
        Ok(vec![EncodedPacket {
            data: out.freeze(),
            pts: frame.pts,
            is_keyframe: true,
            codec: self.descriptor.codec,
        }])
    }

    fn flush(&mut self) -> Vec<EncodedPacket> {
        Vec::new()
    }

    fn frame_size(&self) -> usize {
        self.frame_samples
    }

    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }
}
