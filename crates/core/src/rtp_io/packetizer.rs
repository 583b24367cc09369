//! RTP packetization for the egress path: VP8 fragmentation (RFC 7741) and
//! Opus one-frame-per-packet (RFC 7587).
//!
//! Sequence-number/timestamp bookkeeping mirrors the per-track counter
//! fields (`video_seq_num`, `video_timestamp`) a hand-rolled RTP sender
//! keeps alongside a `TrackLocalStaticRTP`, generalized here into a small
//! owned struct per track instead of loose fields on a larger context.

use bytes::Bytes;
use rtp::header::Header;
use rtp::packet::Packet;

/// Maximum VP8 bitstream bytes per RTP fragment, reserving one byte for the
/// payload descriptor (spec.md §4.6: chunks of <= 1199 bytes of bitstream,
/// plus the 1-byte descriptor, for a 1200-byte RTP payload ceiling).
const VP8_MAX_FRAGMENT_BYTES: usize = 1199;

pub const VP8_PAYLOAD_TYPE: u8 = 97;
pub const OPUS_PAYLOAD_TYPE: u8 = 111;
pub const VIDEO_CLOCK_RATE: u32 = 90_000;
pub const AUDIO_CLOCK_RATE: u32 = 48_000;

/// Per-track packetizer state: wrapping sequence counter and a fixed SSRC
/// for the lifetime of one track.
pub struct RtpPacketizer {
    ssrc: u32,
    sequence_number: u16,
    payload_type: u8,
}

impl RtpPacketizer {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            ssrc,
            sequence_number: 0,
            payload_type,
        }
    }

    fn next_header(&mut self, timestamp: u32, marker: bool) -> Header {
        let header = Header {
            version: 2,
            payload_type: self.payload_type,
            sequence_number: self.sequence_number,
            timestamp,
            ssrc: self.ssrc,
            marker,
            ..Default::default()
        };
        self.sequence_number = self.sequence_number.wrapping_add(1);
        header
    }

    /// Fragment one VP8 encoded frame into RTP packets. Every fragment
    /// shares `pts_ms`'s RTP-timestamp conversion; S=1 marks the first
    /// fragment's descriptor, marker=1 marks the last packet only
    /// (spec.md §4.6, §8 testable property 3).
    pub fn packetize_vp8(&mut self, bitstream: &[u8], pts_ms: i64) -> Vec<Packet> {
        let timestamp = pts_to_rtp_timestamp(pts_ms, VIDEO_CLOCK_RATE);
        if bitstream.is_empty() {
            return Vec::new();
        }

        let chunks: Vec<&[u8]> = bitstream.chunks(VP8_MAX_FRAGMENT_BYTES).collect();
        let last_index = chunks.len() - 1;
        let mut packets = Vec::with_capacity(chunks.len());

        for (i, chunk) in chunks.into_iter().enumerate() {
            let is_first = i == 0;
            let is_last = i == last_index;
            let mut payload = Vec::with_capacity(1 + chunk.len());
            payload.push(if is_first { 0x10 } else { 0x00 }); // S bit only on first fragment.
            payload.extend_from_slice(chunk);

            let header = self.next_header(timestamp, is_last);
            packets.push(Packet {
                header,
                payload: Bytes::from(payload),
            });
        }
        packets
    }

    /// One RTP packet per Opus frame; marker is always set (spec.md §4.6).
    pub fn packetize_opus(&mut self, opus_frame: &[u8], pts_ms: i64) -> Packet {
        let timestamp = pts_to_rtp_timestamp(pts_ms, AUDIO_CLOCK_RATE);
        let header = self.next_header(timestamp, true);
        Packet {
            header,
            payload: Bytes::copy_from_slice(opus_frame),
        }
    }
}

fn pts_to_rtp_timestamp(pts_ms: i64, clock_rate: u32) -> u32 {
    ((pts_ms.max(0) as u64 * clock_rate as u64) / 1000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vp8_frame_fragments_at_1199_bytes() {
        let mut p = RtpPacketizer::new(VP8_PAYLOAD_TYPE, 0xDEAD_BEEF);
        let bitstream = vec![0xAAu8; 2800];
        let packets = p.packetize_vp8(&bitstream, 100);

        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].payload.len(), 1 + 1199);
        assert_eq!(packets[1].payload.len(), 1 + 1199);
        assert_eq!(packets[2].payload.len(), 1 + (2800 - 2 * 1199));

        assert_eq!(packets[0].payload[0], 0x10); // S=1 on first only
        assert_eq!(packets[1].payload[0], 0x00);
        assert_eq!(packets[2].payload[0], 0x00);

        assert!(!packets[0].header.marker);
        assert!(!packets[1].header.marker);
        assert!(packets[2].header.marker);

        // PTS 100ms -> RTP timestamp 9000 at 90kHz.
        assert_eq!(packets[0].header.timestamp, 9000);
        assert_eq!(packets[1].header.timestamp, 9000);
        assert_eq!(packets[2].header.timestamp, 9000);
    }

    #[test]
    fn sequence_numbers_are_contiguous_across_frames() {
        let mut p = RtpPacketizer::new(VP8_PAYLOAD_TYPE, 1);
        let first = p.packetize_vp8(&[0xAA; 10], 0);
        let second = p.packetize_vp8(&[0xBB; 10], 33);
        assert_eq!(first[0].header.sequence_number, 0);
        assert_eq!(second[0].header.sequence_number, 1);
    }

    #[test]
    fn sequence_number_wraps_naturally() {
        let mut p = RtpPacketizer::new(VP8_PAYLOAD_TYPE, 1);
        p.sequence_number = u16::MAX;
        let packets = p.packetize_vp8(&[0xAA; 4], 0);
        assert_eq!(packets[0].header.sequence_number, u16::MAX);
        assert_eq!(p.sequence_number, 0);
    }

    #[test]
    fn opus_packet_has_marker_set() {
        let mut p = RtpPacketizer::new(OPUS_PAYLOAD_TYPE, 2);
        let pkt = p.packetize_opus(&[1, 2, 3], 20);
        assert!(pkt.header.marker);
        assert_eq!(pkt.header.timestamp, 960); // 20ms @ 48kHz
        assert_eq!(&pkt.payload[..], &[1, 2, 3]);
    }

    #[test]
    fn empty_frame_yields_no_packets() {
        let mut p = RtpPacketizer::new(VP8_PAYLOAD_TYPE, 1);
        assert!(p.packetize_vp8(&[], 0).is_empty());
    }
}
