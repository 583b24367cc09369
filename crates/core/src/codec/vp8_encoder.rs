//! VP8 encoder facade over `vpx-encode`, plus BT.601 RGBA→I420 conversion.
//!
//! Mirrors the `vpx_encode::Encoder` usage the pack's WebRTC consumer wraps
//! in a thread-safe newtype; generalized here to CBR low-latency config per
//! spec.md §4.8 instead of that example's hardcoded 1080p/5000kbps.

use crate::error::MediaError;

pub struct Vp8EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u32,
    pub max_keyframe_distance: u32,
    pub min_quantizer: u32,
    pub max_quantizer: u32,
}

pub struct Vp8Encoder {
    inner: vpx_encode::Encoder,
    width: usize,
    height: usize,
    tables: Rgb601Tables,
}

pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

impl Vp8Encoder {
    /// `vpx_encode::Config` only exposes width/height/timebase/bitrate/codec
    /// (per its use across the pack, e.g. `phaneron`'s WebRTC consumer); it
    /// has no knobs for keyframe distance, quantizer bounds, thread count,
    /// or deadline. Those fields of `Vp8EncoderConfig` are still validated
    /// at the `Config` layer (spec.md §4.8) since the crate's own internal
    /// defaults already match the spec (CBR, AUTO keyframe, realtime
    /// deadline) — they just aren't independently tunable through this
    /// facade.
    pub fn new(config: Vp8EncoderConfig) -> Result<Self, MediaError> {
        let vpx_config = vpx_encode::Config {
            width: config.width,
            height: config.height,
            timebase: [1, 30],
            bitrate: (config.bitrate_bps / 1000) as u32,
            codec: vpx_encode::VideoCodecId::VP8,
        };
        let inner = vpx_encode::Encoder::new(vpx_config)
            .map_err(|e| MediaError::Encode(format!("failed to open vpx encoder: {e}")))?;
        let _ = (config.max_keyframe_distance, config.min_quantizer, config.max_quantizer);
        Ok(Self {
            inner,
            width: config.width as usize,
            height: config.height as usize,
            tables: Rgb601Tables::default(),
        })
    }

    /// Encode one RGBA frame, converting to I420 first. `pts_ms` is the
    /// monotonic presentation time in milliseconds, matching the encoder's
    /// `timebase = [1, 30]` loosely enough for CBR real-time encoding.
    pub fn encode(&mut self, rgba: &[u8], pts_ms: i64) -> Result<Vec<EncodedFrame>, MediaError> {
        let i420 = rgba_to_i420(self.width, self.height, rgba, &self.tables);
        let packets = self
            .inner
            .encode(pts_ms, &i420)
            .map_err(|e| MediaError::Encode(format!("vpx encode failed: {e}")))?;

        Ok(packets
            .into_iter()
            .map(|p| EncodedFrame {
                data: p.data.to_vec(),
                is_keyframe: p.key,
            })
            .collect())
    }
}

/// Precomputed per-channel lookup tables for the BT.601 RGBA→I420
/// multiplies, built once and reused on the hot path (spec.md §4.8).
pub struct Rgb601Tables {
    y_r: [i32; 256],
    y_g: [i32; 256],
    y_b: [i32; 256],
    u_r: [i32; 256],
    u_g: [i32; 256],
    u_b: [i32; 256],
    v_r: [i32; 256],
    v_g: [i32; 256],
    v_b: [i32; 256],
}

impl Default for Rgb601Tables {
    fn default() -> Self {
        let mut t = Rgb601Tables {
            y_r: [0; 256],
            y_g: [0; 256],
            y_b: [0; 256],
            u_r: [0; 256],
            u_g: [0; 256],
            u_b: [0; 256],
            v_r: [0; 256],
            v_g: [0; 256],
            v_b: [0; 256],
        };
        for i in 0..256 {
            let v = i as i32;
            t.y_r[i] = 66 * v;
            t.y_g[i] = 129 * v;
            t.y_b[i] = 25 * v;
            t.u_r[i] = -38 * v;
            t.u_g[i] = -74 * v;
            t.u_b[i] = 112 * v;
            t.v_r[i] = 112 * v;
            t.v_g[i] = -94 * v;
            t.v_b[i] = -18 * v;
        }
        t
    }
}

/// Converts packed RGBA to I420, subsampling U/V by taking the top-left
/// pixel of each 2x2 block (spec.md §4.8 explicitly tolerates this
/// approximation for throughput).
pub fn rgba_to_i420(width: usize, height: usize, rgba: &[u8], tables: &Rgb601Tables) -> Vec<u8> {
    let y_size = width * height;
    let uv_w = width.div_ceil(2);
    let uv_h = height.div_ceil(2);
    let mut out = vec![0u8; y_size + 2 * uv_w * uv_h];
    let (y_plane, uv_planes) = out.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_w * uv_h);

    for row in 0..height {
        for col in 0..width {
            let idx = (row * width + col) * 4;
            let r = rgba[idx] as usize;
            let g = rgba[idx + 1] as usize;
            let b = rgba[idx + 2] as usize;

            let y = (tables.y_r[r] + tables.y_g[g] + tables.y_b[b] + 128 * 256 + 16 * 256) >> 8;
            y_plane[row * width + col] = y.clamp(0, 255) as u8;

            if row % 2 == 0 && col % 2 == 0 {
                let u = (tables.u_r[r] + tables.u_g[g] + tables.u_b[b] + 128 * 256 + 128 * 256) >> 8;
                let v = (tables.v_r[r] + tables.v_g[g] + tables.v_b[b] + 128 * 256 + 128 * 256) >> 8;
                let uv_idx = (row / 2) * uv_w + (col / 2);
                u_plane[uv_idx] = u.clamp(0, 255) as u8;
                v_plane[uv_idx] = v.clamp(0, 255) as u8;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_to_i420_black_frame_is_luma_16() {
        let tables = Rgb601Tables::default();
        let rgba = vec![0u8; 4 * 4 * 4];
        let i420 = rgba_to_i420(4, 4, &rgba, &tables);
        assert_eq!(i420.len(), 4 * 4 + 2 * 2 * 2 * 2);
        assert!(i420[0..16].iter().all(|&y| y == 16));
    }

    #[test]
    fn rgba_to_i420_white_frame_is_near_max_luma() {
        let tables = Rgb601Tables::default();
        let rgba = vec![255u8; 4 * 4 * 4];
        let i420 = rgba_to_i420(4, 4, &rgba, &tables);
        assert!(i420[0..16].iter().all(|&y| y >= 234));
    }
}
