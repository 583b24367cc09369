//! VP8/VP9 decode via `vpx-decode`, plus BT.601 I420→RGBA conversion.
//!
//! The decoder context is single-owner (spec.md §9): `VpxDecoder` wraps
//! `vpx_decode::Decoder` and never lets its plane pointers escape past the
//! call that produced them — callers get an owned `I420Frame` copy.

use super::{I420Frame, RgbaFrame};
use crate::error::MediaError;
use crate::rtp_io::VideoCodec;

pub struct VpxDecoder {
    inner: vpx_decode::Decoder,
}

impl VpxDecoder {
    pub fn new(codec: VideoCodec) -> Result<Self, MediaError> {
        let vpx_codec = match codec {
            VideoCodec::Vp8 => vpx_decode::Codec::VP8,
            VideoCodec::Vp9 => vpx_decode::Codec::VP9,
        };
        let inner = vpx_decode::Decoder::new(vpx_codec)
            .map_err(|e| MediaError::Decode(format!("failed to open vpx decoder: {e}")))?;
        Ok(Self { inner })
    }

    /// Decode one encoded packet. Returns zero or more frames (usually one);
    /// a library-reported error is counted by the caller as a decode
    /// failure but never propagated as fatal (spec.md §4.7).
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<I420Frame>, MediaError> {
        let frames = self
            .inner
            .decode(packet)
            .map_err(|e| MediaError::Decode(format!("vpx decode failed: {e}")))?;

        Ok(frames
            .map(|f| I420Frame {
                width: f.width,
                height: f.height,
                y: f.planes[0].to_vec(),
                u: f.planes[1].to_vec(),
                v: f.planes[2].to_vec(),
                y_stride: f.strides[0],
                uv_stride: f.strides[1],
            })
            .collect())
    }
}

/// BT.601 full-range-ish coefficients, matching the libyuv-equivalent ABGR
/// packing spec.md §4.7 calls for (byte order R,G,B,A in memory).
pub fn i420_to_rgba(frame: &I420Frame) -> RgbaFrame {
    let mut out = vec![0u8; frame.width * frame.height * 4];

    for row in 0..frame.height {
        let y_row = &frame.y[row * frame.y_stride..];
        let uv_row = row / 2;
        let u_row = &frame.u[uv_row * frame.uv_stride..];
        let v_row = &frame.v[uv_row * frame.uv_stride..];

        for col in 0..frame.width {
            let y = y_row[col] as i32;
            let u = u_row[col / 2] as i32 - 128;
            let v = v_row[col / 2] as i32 - 128;

            let c = y - 16;
            let r = (298 * c + 409 * v + 128) >> 8;
            let g = (298 * c - 100 * u - 208 * v + 128) >> 8;
            let b = (298 * c + 516 * u + 128) >> 8;

            let idx = (row * frame.width + col) * 4;
            out[idx] = r.clamp(0, 255) as u8;
            out[idx + 1] = g.clamp(0, 255) as u8;
            out[idx + 2] = b.clamp(0, 255) as u8;
            out[idx + 3] = 255;
        }
    }

    RgbaFrame {
        width: frame.width,
        height: frame.height,
        data: out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i420_to_rgba_mid_gray_is_achromatic() {
        let frame = I420Frame {
            width: 2,
            height: 2,
            y: vec![235, 235, 235, 235],
            u: vec![128],
            v: vec![128],
            y_stride: 2,
            uv_stride: 1,
        };
        let rgba = i420_to_rgba(&frame);
        for px in rgba.data.chunks(4) {
            assert_eq!(px[0], px[1]);
            assert_eq!(px[1], px[2]);
            assert_eq!(px[3], 255);
        }
    }
}
