//! Codec-specific resolution legalization.
//!
//! Conferencing-era codecs only accept a handful of frame sizes or demand
//! macroblock alignment. This maps any requested resolution to the nearest
//! one the codec's standard profile supports. Invoked during preference
//! negotiation and again on live resolution changes, so it must be pure and
//! idempotent.

use crate::CodecId;

const H263P_MAX_WIDTH: u32 = 2048;
const H263P_MAX_HEIGHT: u32 = 1152;

/// Snap a requested resolution to what the codec can actually encode.
pub fn legalize(codec: CodecId, width: u32, height: u32) -> (u32, u32) {
    match codec {
        // QCIF or CIF only
        CodecId::H261 => {
            if width > 176 {
                (352, 288)
            } else {
                (176, 144)
            }
        }
        // SQCIF, QCIF, CIF, 4CIF, 16CIF
        CodecId::H263 => {
            if width > 704 {
                (1408, 1152)
            } else if width > 352 {
                (704, 576)
            } else if width > 176 {
                (352, 288)
            } else if width > 128 {
                (176, 144)
            } else {
                (128, 96)
            }
        }
        // bounded, both dimensions aligned to 4
        CodecId::H263Plus => {
            let w = width.min(H263P_MAX_WIDTH);
            let h = height.min(H263P_MAX_HEIGHT);
            (round_up(w, 4), round_up(h, 4))
        }
        // both dimensions aligned to 2
        CodecId::H264 | CodecId::Hevc => (round_up(width, 2), round_up(height, 2)),
        // fixed CIF
        CodecId::Theora => (352, 288),
        _ => (width, height),
    }
}

fn round_up(value: u32, stride: u32) -> u32 {
    value.div_ceil(stride) * stride
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h261_snaps_to_cif_or_qcif() {
        assert_eq!(legalize(CodecId::H261, 640, 480), (352, 288));
        assert_eq!(legalize(CodecId::H261, 160, 120), (176, 144));
    }

    #[test]
    fn h263_width_ladder() {
        assert_eq!(legalize(CodecId::H263, 1920, 1080), (1408, 1152));
        assert_eq!(legalize(CodecId::H263, 640, 480), (704, 576));
        assert_eq!(legalize(CodecId::H263, 320, 240), (352, 288));
        assert_eq!(legalize(CodecId::H263, 160, 120), (176, 144));
        assert_eq!(legalize(CodecId::H263, 100, 80), (128, 96));
    }

    #[test]
    fn h263p_clamps_then_aligns_to_4() {
        assert_eq!(legalize(CodecId::H263Plus, 4000, 3000), (2048, 1152));
        assert_eq!(legalize(CodecId::H263Plus, 353, 289), (356, 292));
        assert_eq!(legalize(CodecId::H263Plus, 352, 288), (352, 288));
    }

    #[test]
    fn h264_aligns_to_2() {
        assert_eq!(legalize(CodecId::H264, 353, 289), (354, 290));
        assert_eq!(legalize(CodecId::Hevc, 353, 289), (354, 290));
        assert_eq!(legalize(CodecId::H264, 1920, 1080), (1920, 1080));
    }

    #[test]
    fn theora_is_fixed() {
        assert_eq!(legalize(CodecId::Theora, 1920, 1080), (352, 288));
    }

    #[test]
    fn unconstrained_codecs_pass_through() {
        assert_eq!(legalize(CodecId::Mjpeg, 123, 457), (123, 457));
        assert_eq!(legalize(CodecId::Mpeg4, 123, 457), (123, 457));
    }

    #[test]
    fn legalize_is_a_projection() {
        let cases = [
            (CodecId::H261, 640, 480),
            (CodecId::H263, 999, 777),
            (CodecId::H263Plus, 353, 289),
            (CodecId::H264, 353, 289),
            (CodecId::Theora, 11, 7),
            (CodecId::Mjpeg, 353, 289),
        ];
        for (codec, w, h) in cases {
            let once = legalize(codec, w, h);
            let twice = legalize(codec, once.0, once.1);
            assert_eq!(once, twice, "{codec} {w}x{h}");
        }
    }
}
