//! RTP depacketization and packetization for the codecs this bridge carries:
//! VP8 and VP9 video, Opus audio, and H.264 recognition on ingress only.
//!
//! Built directly on the `rtp` crate's packet type rather than a payload
//! abstraction crate, the same way the pack's lower-level protocol code
//! parses wire formats by hand.

pub mod depacketizer;
pub mod packetizer;

use bytes::Bytes;

/// One fully reassembled media frame, ready for the decoder or the
/// Matroska writer.
#[derive(Debug, Clone)]
pub struct DepacketizedFrame {
    pub payload: Bytes,
    pub is_keyframe: bool,
}

/// The codecs this bridge ever depacketizes or packetizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Vp8,
    Vp9,
}

impl VideoCodec {
    pub fn mkv_codec_id(self) -> &'static str {
        match self {
            VideoCodec::Vp8 => "V_VP8",
            VideoCodec::Vp9 => "V_VP9",
        }
    }
}
