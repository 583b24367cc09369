//! Payload-descriptor parsing and frame reassembly for VP8, VP9, Opus, and
//! (ingress-only, recognition-grade) H.264.

use bytes::{Bytes, BytesMut};

use crate::error::MediaError;
use crate::rtp_io::DepacketizedFrame;

/// VP8 sync code that appears at the start of every key frame's first
/// partition, immediately after the 3-byte uncompressed frame tag (RFC 6386
/// §9.1).
const VP8_KEYFRAME_SYNC_CODE: [u8; 3] = [0x9D, 0x01, 0x2A];

/// Reassembles VP8 RTP payloads (RFC 7741 §4.2) into complete frames,
/// accumulating partitions until the RTP marker bit closes out a frame.
#[derive(Debug, Default)]
pub struct Vp8Depacketizer {
    assembling: BytesMut,
    started: bool,
}

impl Vp8Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one RTP payload (descriptor + VP8 bitstream fragment). Returns
    /// `Some(frame)` once the marker bit closes a complete frame.
    pub fn push(
        &mut self,
        rtp_payload: &[u8],
        marker: bool,
    ) -> Result<Option<DepacketizedFrame>, MediaError> {
        let body = parse_vp8_descriptor(rtp_payload)?;
        if !self.started {
            self.assembling.clear();
            self.started = true;
        }
        self.assembling.extend_from_slice(body);

        if !marker {
            return Ok(None);
        }
        self.started = false;
        let payload = std::mem::take(&mut self.assembling).freeze();
        let is_keyframe = is_vp8_keyframe(&payload);
        Ok(Some(DepacketizedFrame { payload, is_keyframe }))
    }
}

/// Strip the VP8 payload descriptor (and optional extension bytes) and
/// return the remaining bitstream fragment.
fn parse_vp8_descriptor(data: &[u8]) -> Result<&[u8], MediaError> {
    let &first = data
        .first()
        .ok_or_else(|| MediaError::Depacketize("empty VP8 RTP payload".into()))?;
    let extended = first & 0x80 != 0;
    let mut offset = 1;

    if extended {
        let &ext = data
            .get(offset)
            .ok_or_else(|| MediaError::Depacketize("truncated VP8 extension byte".into()))?;
        offset += 1;
        let picture_id_present = ext & 0x80 != 0;
        let tl0_present = ext & 0x40 != 0;
        let tid_or_keyidx_present = ext & 0x20 != 0 || ext & 0x10 != 0;

        if picture_id_present {
            let &pid_byte = data
                .get(offset)
                .ok_or_else(|| MediaError::Depacketize("truncated VP8 picture ID".into()))?;
            offset += 1;
            if pid_byte & 0x80 != 0 {
                offset += 1; // 15-bit picture ID spans a second byte.
            }
        }
        if tl0_present {
            offset += 1;
        }
        if tid_or_keyidx_present {
            offset += 1;
        }
    }

    data.get(offset..)
        .ok_or_else(|| MediaError::Depacketize("VP8 descriptor longer than payload".into()))
}

fn is_vp8_keyframe(frame: &[u8]) -> bool {
    if frame.len() < 6 {
        return false;
    }
    let frame_tag = frame[0] as u32 | (frame[1] as u32) << 8 | (frame[2] as u32) << 16;
    let is_key_frame_bit = frame_tag & 0x1 == 0;
    is_key_frame_bit && frame[3..6] == VP8_KEYFRAME_SYNC_CODE
}

/// Reassembles VP9 RTP payloads (draft-ietf-payload-vp9 descriptor) into
/// complete frames, using the B (start) and E (end) bits rather than the
/// marker bit alone, since a VP9 superframe may span several RTP packets
/// whose marker bit is only set on the last one.
#[derive(Debug, Default)]
pub struct Vp9Depacketizer {
    assembling: BytesMut,
    started: bool,
}

impl Vp9Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        rtp_payload: &[u8],
        _marker: bool,
    ) -> Result<Option<DepacketizedFrame>, MediaError> {
        let descriptor = parse_vp9_descriptor(rtp_payload)?;

        if descriptor.start_of_frame {
            self.assembling.clear();
            self.started = true;
        }
        if !self.started {
            // A continuation packet arrived before we ever saw a start bit;
            // drop it rather than build a corrupt frame.
            return Ok(None);
        }
        self.assembling.extend_from_slice(descriptor.payload);

        if !descriptor.end_of_frame {
            return Ok(None);
        }
        self.started = false;
        let payload = std::mem::take(&mut self.assembling).freeze();
        Ok(Some(DepacketizedFrame {
            payload,
            is_keyframe: descriptor.is_keyframe,
        }))
    }
}

struct Vp9Descriptor<'a> {
    start_of_frame: bool,
    end_of_frame: bool,
    is_keyframe: bool,
    payload: &'a [u8],
}

fn parse_vp9_descriptor(data: &[u8]) -> Result<Vp9Descriptor<'_>, MediaError> {
    let &first = data
        .first()
        .ok_or_else(|| MediaError::Depacketize("empty VP9 RTP payload".into()))?;
    let i = first & 0x80 != 0;
    let p = first & 0x40 != 0;
    let l = first & 0x20 != 0;
    let f = first & 0x10 != 0;
    let b = first & 0x08 != 0;
    let e = first & 0x04 != 0;
    let v = first & 0x02 != 0;
    let mut offset = 1;

    if i {
        let &pid0 = data
            .get(offset)
            .ok_or_else(|| MediaError::Depacketize("truncated VP9 picture ID".into()))?;
        offset += 1;
        if pid0 & 0x80 != 0 {
            offset += 1;
        }
    }
    if l {
        offset += 1;
        if !f {
            offset += 1; // TL0PICIDX, only present in non-flexible mode.
        }
    }
    if f && p {
        // One reference-index byte per P_DIFF entry (N bit chains them);
        // we don't need the indices themselves, just to skip past them.
        loop {
            let &r = data
                .get(offset)
                .ok_or_else(|| MediaError::Depacketize("truncated VP9 reference index".into()))?;
            offset += 1;
            if r & 0x01 == 0 {
                break;
            }
        }
    }
    if v {
        offset += parse_vp9_scalability_structure(&data[offset..])?;
    }

    let payload = data
        .get(offset..)
        .ok_or_else(|| MediaError::Depacketize("VP9 descriptor longer than payload".into()))?;

    // A key frame is the start of a non-inter-predicted superframe.
    let is_keyframe = b && !p;

    Ok(Vp9Descriptor {
        start_of_frame: b,
        end_of_frame: e,
        is_keyframe,
        payload,
    })
}

fn parse_vp9_scalability_structure(data: &[u8]) -> Result<usize, MediaError> {
    let &first = data
        .first()
        .ok_or_else(|| MediaError::Depacketize("truncated VP9 scalability structure".into()))?;
    let n_s = ((first >> 5) & 0x07) as usize + 1;
    let y = first & 0x10 != 0;
    let g = first & 0x08 != 0;
    let mut offset = 1;

    if y {
        offset += 4 * n_s; // width(2) + height(2) per spatial layer
    }

    if g {
        let &n_g = data
            .get(offset)
            .ok_or_else(|| MediaError::Depacketize("truncated VP9 SS group count".into()))?;
        offset += 1;
        for _ in 0..n_g {
            let &entry = data
                .get(offset)
                .ok_or_else(|| MediaError::Depacketize("truncated VP9 SS group entry".into()))?;
            offset += 1;
            let r = (entry >> 2) & 0x03;
            offset += r as usize; // one reference-index byte per R
        }
    }

    Ok(offset)
}

/// Opus carries no RTP payload descriptor; one packet is one Opus frame
/// (recoverable from the TOC byte by the decoder itself). Passthrough only.
pub fn depacketize_opus(rtp_payload: &[u8]) -> DepacketizedFrame {
    DepacketizedFrame {
        payload: Bytes::copy_from_slice(rtp_payload),
        is_keyframe: true,
    }
}

/// Minimal H.264 (RFC 6184) depacketizer: reassembles FU-A fragments and
/// flattens STAP-A aggregates into Annex-B start-code-delimited NAL units.
/// Ingress recognition only — this bridge never encodes H.264.
#[derive(Debug, Default)]
pub struct H264Depacketizer {
    assembling: BytesMut,
    in_fragment: bool,
}

const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        rtp_payload: &[u8],
        marker: bool,
    ) -> Result<Option<DepacketizedFrame>, MediaError> {
        let &header = rtp_payload
            .first()
            .ok_or_else(|| MediaError::Depacketize("empty H.264 RTP payload".into()))?;
        let nal_type = header & 0x1F;

        match nal_type {
            1..=23 => {
                // Single NAL unit packet.
                self.assembling.extend_from_slice(&ANNEX_B_START_CODE);
                self.assembling.extend_from_slice(rtp_payload);
            }
            24 => {
                // STAP-A: a sequence of (u16 length, NAL) entries.
                let mut offset = 1;
                while offset + 2 <= rtp_payload.len() {
                    let size = u16::from_be_bytes([rtp_payload[offset], rtp_payload[offset + 1]]) as usize;
                    offset += 2;
                    let end = offset + size;
                    if end > rtp_payload.len() {
                        return Err(MediaError::Depacketize("STAP-A NAL length overruns packet".into()));
                    }
                    self.assembling.extend_from_slice(&ANNEX_B_START_CODE);
                    self.assembling.extend_from_slice(&rtp_payload[offset..end]);
                    offset = end;
                }
            }
            28 => {
                // FU-A.
                let &fu_header = rtp_payload
                    .get(1)
                    .ok_or_else(|| MediaError::Depacketize("truncated FU-A header".into()))?;
                let start = fu_header & 0x80 != 0;
                let nal_header = (header & 0xE0) | (fu_header & 0x1F);

                if start {
                    self.assembling.extend_from_slice(&ANNEX_B_START_CODE);
                    self.assembling.extend_from_slice(&[nal_header]);
                    self.in_fragment = true;
                }
                if !self.in_fragment {
                    return Ok(None);
                }
                self.assembling.extend_from_slice(&rtp_payload[2..]);
            }
            other => {
                return Err(MediaError::Depacketize(format!(
                    "unsupported H.264 NAL unit type {other}"
                )));
            }
        }

        if !marker {
            return Ok(None);
        }
        self.in_fragment = false;
        let payload = std::mem::take(&mut self.assembling).freeze();
        // Recognition only: treat any frame that carries an IDR slice NAL
        // (type 5) as a key frame.
        let is_keyframe = contains_idr_nal(&payload);
        Ok(Some(DepacketizedFrame { payload, is_keyframe }))
    }
}

fn contains_idr_nal(annex_b: &[u8]) -> bool {
    let mut i = 0;
    while i + 4 <= annex_b.len() {
        if annex_b[i..i + 4] == ANNEX_B_START_CODE {
            if let Some(&nal_byte) = annex_b.get(i + 4) {
                if nal_byte & 0x1F == 5 {
                    return true;
                }
            }
        }
        i += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vp8_simple_mode_no_extension() {
        let mut d = Vp8Depacketizer::new();
        let mut payload = vec![0x10u8]; // S=1, non-extended
        payload.extend_from_slice(&[0x30, 0x00, 0x00]); // frame_tag: key frame bit 0
        payload.extend_from_slice(&VP8_KEYFRAME_SYNC_CODE);
        payload.extend_from_slice(&[0xAA, 0xBB]);
        let frame = d.push(&payload, true).unwrap().unwrap();
        assert!(frame.is_keyframe);
        assert_eq!(&frame.payload[3..6], &VP8_KEYFRAME_SYNC_CODE);
    }

    #[test]
    fn vp8_interframe_is_not_keyframe() {
        let mut d = Vp8Depacketizer::new();
        let mut payload = vec![0x10u8];
        payload.extend_from_slice(&[0x31, 0x00, 0x00]); // key_frame bit set to 1 (inter frame)
        payload.extend_from_slice(&[1, 2, 3, 4]);
        let frame = d.push(&payload, true).unwrap().unwrap();
        assert!(!frame.is_keyframe);
    }

    #[test]
    fn vp8_multi_packet_accumulates_until_marker() {
        let mut d = Vp8Depacketizer::new();
        let first = [0x10u8, 0xAA, 0xBB];
        assert!(d.push(&first, false).unwrap().is_none());
        let mut second = vec![0x00u8]; // continuation, S=0
        second.extend_from_slice(&[0x30, 0x00, 0x00]);
        second.extend_from_slice(&VP8_KEYFRAME_SYNC_CODE);
        let frame = d.push(&second, true).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 2 + 3 + 3);
    }

    #[test]
    fn vp8_picture_id_extension_is_skipped() {
        let mut d = Vp8Depacketizer::new();
        // X=1,S=1 ; ext byte I=1 ; picture id M=0 (7-bit, 1 byte) ; VP8 bitstream follows.
        let mut payload = vec![0x90u8, 0x80u8, 0x05u8];
        payload.extend_from_slice(&[0x31, 0x00, 0x00]);
        let frame = d.push(&payload, true).unwrap().unwrap();
        assert_eq!(&frame.payload[..], &[0x31, 0x00, 0x00]);
    }

    #[test]
    fn vp9_start_and_end_bits_delimit_frame() {
        let mut d = Vp9Depacketizer::new();
        // I=0 P=0 L=0 F=0 B=1 E=0 V=0: descriptor is 1 byte.
        let first = [0b0000_1000u8, 0xAA, 0xBB];
        assert!(d.push(&first, false).unwrap().is_none());
        // B=0 E=1 (continuation, final packet).
        let second = [0b0000_0100u8, 0xCC];
        let frame = d.push(&second, true).unwrap().unwrap();
        assert!(frame.is_keyframe);
        assert_eq!(&frame.payload[..], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn opus_is_passthrough() {
        let frame = depacketize_opus(&[1, 2, 3]);
        assert_eq!(&frame.payload[..], &[1, 2, 3]);
        assert!(frame.is_keyframe);
    }

    #[test]
    fn h264_single_nal_unit_packet() {
        let mut d = H264Depacketizer::new();
        let payload = [0x65u8, 0xAA, 0xBB]; // type 5 = IDR slice
        let frame = d.push(&payload, true).unwrap().unwrap();
        assert!(frame.is_keyframe);
        assert_eq!(&frame.payload[..4], &ANNEX_B_START_CODE);
    }

    #[test]
    fn h264_fu_a_reassembles_fragments() {
        let mut d = H264Depacketizer::new();
        let fu_indicator = 0x7Cu8; // type 28
        let start_header = 0x85u8; // S=1, type=5 (IDR)
        let mid_header = 0x05u8; // no S/E, type=5
        let end_header = 0x45u8; // E=1, type=5

        let first = [fu_indicator, start_header, 0x01, 0x02];
        assert!(d.push(&first, false).unwrap().is_none());
        let second = [fu_indicator, mid_header, 0x03, 0x04];
        assert!(d.push(&second, false).unwrap().is_none());
        let third = [fu_indicator, end_header, 0x05];
        let frame = d.push(&third, true).unwrap().unwrap();
        assert!(frame.is_keyframe);
        // start-code + reconstructed NAL header + payload bytes from all three fragments
        assert_eq!(&frame.payload[4..], &[0x65, 0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn h264_stap_a_splits_aggregated_nals() {
        let mut d = H264Depacketizer::new();
        let mut payload = vec![24u8]; // STAP-A
        payload.extend_from_slice(&(2u16).to_be_bytes());
        payload.extend_from_slice(&[0x67, 0xAA]); // SPS (type 7)
        payload.extend_from_slice(&(2u16).to_be_bytes());
        payload.extend_from_slice(&[0x68, 0xBB]); // PPS (type 8)
        let frame = d.push(&payload, true).unwrap().unwrap();
        // Two NALs, each prefixed with a 4-byte start code.
        assert_eq!(frame.payload.len(), 2 * (4 + 2));
    }
}
