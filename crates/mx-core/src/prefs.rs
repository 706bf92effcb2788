//! Output stream preference negotiation.
//!
//! A preference request is applied all-or-nothing: an unsupported codec
//! rejects the whole request and leaves the active settings untouched.
//! Resolutions are legalized for the codec and packet sizes are stripped
//! of worst-case transport overhead before they are stored, so comparing
//! a request against the active settings compares what would actually
//! take effect.

use mx_codec::legalize::legalize;
use mx_codec::{CodecId, EncoderFactory};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_QUALITY: u8 = 20;
pub const DEFAULT_MAX_PACKET_SIZE: usize = 500;
pub const DEFAULT_VIDEO_BIT_RATE: u32 = 90 * 1024;
pub const DEFAULT_AUDIO_BIT_RATE: u32 = 256 * 1024;
pub const DEFAULT_RESOLUTION: (u32, u32) = (352, 288);

/// Reassembly buffer on the receiving side; the payload budget may never
/// exceed it, less some room for the reassembly bookkeeping.
const FRAGMENT_BUFFER_SIZE: usize = 2048;
const FRAGMENT_BUFFER_RESERVE: usize = 256;

// worst-case per-packet transport overhead
const IPV6_HEADER: usize = 40;
const IP_OPTIONS: usize = 8;
const TCP_HEADER: usize = 32;
const FRAGMENT_HEADER: usize = 2;

/// Usable payload bytes per packet of `max_packet_size` on the wire.
pub fn payload_budget(codec: CodecId, max_packet_size: usize) -> usize {
    let overhead = IPV6_HEADER
        + IP_OPTIONS
        + TCP_HEADER
        + FRAGMENT_HEADER
        + codec.max_packetization_header();
    max_packet_size
        .saturating_sub(overhead)
        .min(FRAGMENT_BUFFER_SIZE - FRAGMENT_BUFFER_RESERVE)
}

/// A requested output configuration, as it arrives from a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceRequest {
    pub codec: CodecId,
    pub quality: u8,
    /// `None` picks the codec-type default.
    pub bit_rate: Option<u32>,
    pub max_packet_size: usize,
    pub resolution: (u32, u32),
    pub max_frame_rate: Option<f32>,
    /// Restart a running encoder so the new settings take effect now
    /// instead of at the next open.
    pub reset: bool,
}

/// The active output configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPreferences {
    pub codec: CodecId,
    pub quality: u8,
    pub bit_rate: u32,
    pub max_packet_size: usize,
    /// Derived payload budget, transport overhead already subtracted.
    pub max_payload: usize,
    pub resolution: (u32, u32),
    pub max_frame_rate: Option<f32>,
}

impl StreamPreferences {
    pub fn video_defaults() -> Self {
        Self {
            codec: CodecId::H261,
            quality: DEFAULT_QUALITY,
            bit_rate: DEFAULT_VIDEO_BIT_RATE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_payload: payload_budget(CodecId::H261, DEFAULT_MAX_PACKET_SIZE),
            resolution: DEFAULT_RESOLUTION,
            max_frame_rate: None,
        }
    }

    pub fn audio_defaults() -> Self {
        Self {
            codec: CodecId::PcmMulaw,
            quality: DEFAULT_QUALITY,
            bit_rate: DEFAULT_AUDIO_BIT_RATE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_payload: payload_budget(CodecId::PcmMulaw, DEFAULT_MAX_PACKET_SIZE),
            resolution: (0, 0),
            max_frame_rate: None,
        }
    }

    /// Apply a request. Returns whether anything changed; a rejected
    /// request changes nothing.
    pub fn apply(&mut self, request: &PreferenceRequest) -> bool {
        if !EncoderFactory::is_supported(request.codec) {
            warn!(codec = %request.codec, "rejecting stream preferences, no encoder for codec");
            return false;
        }

        let resolution = if request.codec.is_video() {
            legalize(request.codec, request.resolution.0, request.resolution.1)
        } else {
            request.resolution
        };
        let max_payload = payload_budget(request.codec, request.max_packet_size);

        let bit_rate = request.bit_rate.unwrap_or(if request.codec.is_video() {
            DEFAULT_VIDEO_BIT_RATE
        } else {
            DEFAULT_AUDIO_BIT_RATE
        });
        let next = Self {
            codec: request.codec,
            quality: request.quality.min(100),
            bit_rate,
            max_packet_size: request.max_packet_size,
            max_payload,
            resolution,
            max_frame_rate: request.max_frame_rate.filter(|fps| *fps > 0.0),
        };
        if next == *self {
            return false;
        }
        info!(
            codec = %next.codec,
            quality = next.quality,
            bit_rate = next.bit_rate,
            payload = next.max_payload,
            width = next.resolution.0,
            height = next.resolution.1,
            "applying stream preferences"
        );
        *self = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(codec: CodecId) -> PreferenceRequest {
        PreferenceRequest {
            codec,
            quality: 20,
            bit_rate: None,
            max_packet_size: 500,
            resolution: (352, 288),
            max_frame_rate: None,
            reset: false,
        }
    }

    #[test]
    fn unsupported_codec_rejects_the_whole_request() {
        let mut prefs = StreamPreferences::audio_defaults();
        let before = prefs.clone();
        let mut req = request(CodecId::Aac);
        req.quality = 90;
        assert!(!prefs.apply(&req));
        assert_eq!(prefs, before);
    }

    #[test]
    fn identical_request_reports_no_change() {
        let mut prefs = StreamPreferences::video_defaults();
        let req = request(CodecId::H264);
        assert!(prefs.apply(&req));
        assert!(!prefs.apply(&req));
    }

    #[test]
    fn resolution_is_legalized_before_comparing() {
        let mut prefs = StreamPreferences::video_defaults();
        let mut req = request(CodecId::H264);
        req.resolution = (353, 289);
        assert!(prefs.apply(&req));
        assert_eq!(prefs.resolution, (354, 290));
        // same request again lands on the same legalized resolution
        assert!(!prefs.apply(&req));
    }

    #[test]
    fn payload_budget_subtracts_worst_case_overhead() {
        // 500 - 40 (IPv6) - 8 (options) - 32 (TCP) - 2 (fragment)
        // - 16 (RTP + H.264 packetization) = 402
        assert_eq!(payload_budget(CodecId::H264, 500), 402);
        // small packets never go negative
        assert_eq!(payload_budget(CodecId::H264, 50), 0);
        // huge packets are clamped to the reassembly buffer
        assert_eq!(payload_budget(CodecId::H264, 64_000), 2048 - 256);
    }
}
