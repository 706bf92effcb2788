use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod legalize;
pub mod software;

pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no encoder available for codec {0}")]
    UnsupportedCodec(CodecId),

    #[error("initialization failed: {0}")]
    InitFailed(String),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecId {
    // video
    H261,
    H263,
    H263Plus,
    H264,
    Hevc,
    Mpeg4,
    Mjpeg,
    Theora,
    // audio
    PcmAlaw,
    PcmMulaw,
    G722,
    Gsm,
    Mp3,
    Aac,
}

impl CodecId {
    pub fn is_video(self) -> bool {
        matches!(
            self,
            CodecId::H261
                | CodecId::H263
                | CodecId::H263Plus
                | CodecId::H264
                | CodecId::Hevc
                | CodecId::Mpeg4
                | CodecId::Mjpeg
                | CodecId::Theora
        )
    }

    pub fn is_audio(self) -> bool {
        !self.is_video()
    }

    /// Worst-case packetization header for this codec, on top of the fixed
    /// 12-byte RTP header. Used to derive the true payload budget from a
    /// requested packet size.
    pub fn max_packetization_header(self) -> usize {
        const RTP_BASE_HEADER: usize = 12;
        let codec_header = match self {
            CodecId::H261 => 4,
            CodecId::H263 => 8,
            CodecId::H263Plus => 2,
            CodecId::H264 | CodecId::Hevc => 4,
            CodecId::Mpeg4 => 4,
            CodecId::Mjpeg => 8,
            CodecId::Theora => 4,
            CodecId::Mp3 => 4,
            CodecId::Aac => 4,
            CodecId::PcmAlaw | CodecId::PcmMulaw | CodecId::G722 | CodecId::Gsm => 0,
        };
        RTP_BASE_HEADER + codec_header
    }
}

impl std::fmt::Display for CodecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CodecId::H261 => "H.261",
            CodecId::H263 => "H.263",
            CodecId::H263Plus => "H.263+",
            CodecId::H264 => "H.264",
            CodecId::Hevc => "H.265",
            CodecId::Mpeg4 => "MPEG-4",
            CodecId::Mjpeg => "MJPEG",
            CodecId::Theora => "Theora",
            CodecId::PcmAlaw => "PCM A-law",
            CodecId::PcmMulaw => "PCM mu-law",
            CodecId::G722 => "G.722",
            CodecId::Gsm => "GSM",
            CodecId::Mp3 => "MP3",
            CodecId::Aac => "AAC",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamParams {
    Video { width: u32, height: u32, fps: f32 },
    Audio { sample_rate: u32, channels: u8 },
}

/// Everything an encoder session needs to come up.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub codec: CodecId,
    /// 0..=100, higher is better. Maps onto GOP length and quantizer range.
    pub quality: u8,
    pub bit_rate: u32,
    /// Payload budget per packet, already stripped of transport overhead.
    pub max_payload: usize,
    pub params: StreamParams,
    pub threaded: bool,
}

impl StreamDescriptor {
    /// Keyframe distance derived from the quality setting.
    pub fn gop_size(&self) -> u32 {
        ((100 - u32::from(self.quality)) / 5).max(1)
    }

    /// Upper quantizer bound derived from the quality setting.
    pub fn qmax(&self) -> u32 {
        2 + (100 - u32::from(self.quality)) / 4
    }
}

/// One raw frame handed to an encoder session. For video this is a full
/// picture at the descriptor's resolution; for audio one packed frame of
/// s16 samples.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub pts: i64,
}

#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub pts: i64,
    pub is_keyframe: bool,
    pub codec: CodecId,
}

impl EncodedPacket {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// A live encoder session. Sessions return their output instead of writing
/// through a callback, so there is no hidden coupling back to the caller.
pub trait EncoderSession: Send {
    /// Encode one frame. An empty vec means the codec buffered the input
    /// and will emit it later (or on flush).
    fn encode(&mut self, frame: &Frame) -> Result<Vec<EncodedPacket>>;

    /// Drain whatever the codec still holds.
    fn flush(&mut self) -> Vec<EncodedPacket>;

    /// Samples per channel the codec consumes per frame. Zero for video.
    fn frame_size(&self) -> usize;

    fn descriptor(&self) -> &StreamDescriptor;
}

/// Output sample layout an audio codec forces, regardless of the input.
pub fn audio_output_layout(codec: CodecId, input_rate: u32, input_channels: u8) -> (u32, u8) {
    match codec {
        CodecId::G722 => (16_000, 1),
        CodecId::PcmAlaw | CodecId::PcmMulaw | CodecId::Gsm => (8_000, 1),
        CodecId::Mp3 => (input_rate, input_channels),
        _ => (44_100, 2),
    }
}

/// Whether the codec consumes planar (per-channel plane) sample buffers.
pub fn is_planar(codec: CodecId) -> bool {
    matches!(codec, CodecId::Mp3)
}

pub struct EncoderFactory;

impl EncoderFactory {
    /// An encoder implementation exists for this codec.
    pub fn is_supported(codec: CodecId) -> bool {
        !matches!(codec, CodecId::Aac)
    }

    /// The codec can run a threaded encode.
    pub fn supports_threading(codec: CodecId) -> bool {
        matches!(
            codec,
            CodecId::H264 | CodecId::Hevc | CodecId::Mpeg4 | CodecId::Mjpeg
        )
    }

    pub fn available_codecs() -> Vec<CodecId> {
        [
            CodecId::H261,
            CodecId::H263,
            CodecId::H263Plus,
            CodecId::H264,
            CodecId::Hevc,
            CodecId::Mpeg4,
            CodecId::Mjpeg,
            CodecId::Theora,
            CodecId::PcmAlaw,
            CodecId::PcmMulaw,
            CodecId::G722,
            CodecId::Gsm,
            CodecId::Mp3,
        ]
        .into_iter()
        .filter(|c| Self::is_supported(*c))
        .collect()
    }

    pub fn open(descriptor: &StreamDescriptor) -> Result<Box<dyn EncoderSession>> {
        if !Self::is_supported(descriptor.codec) {
            return Err(CodecError::UnsupportedCodec(descriptor.codec));
        }

        tracing::info!(codec = %descriptor.codec, threaded = descriptor.threaded, "opening encoder session");

        match descriptor.params {
            StreamParams::Video { .. } => {
                if !descriptor.codec.is_video() {
                    return Err(CodecError::InvalidConfig(format!(
                        "{} is not a video codec",
                        descriptor.codec
                    )));
                }
                Ok(Box::new(software::SoftwareVideoSession::open(
                    descriptor.clone(),
                )?))
            }
            StreamParams::Audio { .. } => {
                if !descriptor.codec.is_audio() {
                    return Err(CodecError::InvalidConfig(format!(
                        "{} is not an audio codec",
                        descriptor.codec
                    )));
                }
                Ok(Box::new(software::SoftwareAudioSession::open(
                    descriptor.clone(),
                )?))
            }
        }
    }
}
