//! EBML primitive encode/decode: variable-length integers, element IDs,
//! and the handful of leaf-value types the Matroska reader/writer need
//! (uint, float, string, binary/SimpleBlock payload).
//!
//! No existing Matroska crate is reused here — this module, together with
//! `mkv::reader`/`mkv::writer`, implements the wire format directly, the way
//! the pack's lower-level RTP/RTCP crates parse their own wire formats by
//! hand rather than through a high-level abstraction.

use crate::error::EbmlError;
use bytes::{BufMut, BytesMut};

/// Maximum vint length this codec supports (EBML allows up to 8).
const MAX_VINT_LEN: usize = 8;

/// Decode an EBML variable-length integer (vint) from the front of `data`.
///
/// Returns the decoded value with the length-descriptor bits masked off, the
/// number of bytes consumed, and whether the value is the reserved
/// "unknown size" marker (all data bits set to 1).
pub fn decode_vint(data: &[u8]) -> Result<(u64, usize, bool), EbmlError> {
    let first = *data.first().ok_or(EbmlError::EmptyVint)?;
    if first == 0 {
        return Err(EbmlError::InvalidLengthDescriptor(0));
    }
    let len = (first.leading_zeros() + 1) as usize;
    if len > MAX_VINT_LEN {
        return Err(EbmlError::InvalidLengthDescriptor(first));
    }
    if data.len() < len {
        return Err(EbmlError::TruncatedVint {
            need: len,
            have: data.len(),
        });
    }

    // Mask off the length-descriptor bit in the first byte, then the
    // remaining bytes contribute all 8 bits each.
    let marker_bit = 0x80u8 >> (len - 1);
    let mut value = (first & !marker_bit) as u64;
    let mut all_ones = first & !marker_bit == marker_bit - 1;
    for &b in &data[1..len] {
        value = (value << 8) | b as u64;
        all_ones &= b == 0xFF;
    }

    Ok((value, len, all_ones))
}

/// Decode a vint and return its raw value *without* stripping the
/// length-descriptor bit — this is how EBML element IDs are stored (the
/// descriptor bits are part of the ID's identity).
pub fn decode_vint_raw_id(data: &[u8]) -> Result<(u64, usize), EbmlError> {
    let first = *data.first().ok_or(EbmlError::EmptyVint)?;
    if first == 0 {
        return Err(EbmlError::InvalidIdFirstByte);
    }
    let len = (first.leading_zeros() + 1) as usize;
    if len > 4 {
        return Err(EbmlError::IdTooLong);
    }
    if data.len() < len {
        return Err(EbmlError::TruncatedVint {
            need: len,
            have: data.len(),
        });
    }
    let mut value = first as u64;
    for &b in &data[1..len] {
        value = (value << 8) | b as u64;
    }
    Ok((value, len))
}

/// Encode `n` as an EBML vint using the smallest length descriptor that can
/// hold it (1..=8 bytes).
pub fn encode_vint(n: u64) -> BytesMut {
    for len in 1..=MAX_VINT_LEN {
        let usable_bits = 7 * len;
        let max = if usable_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << usable_bits) - 1
        };
        if n <= max {
            let marker = 0x80u8 >> (len - 1);
            let mut buf = BytesMut::with_capacity(len);
            let mut bytes = [0u8; MAX_VINT_LEN];
            for i in (0..len).rev() {
                bytes[i] = (n >> (8 * (len - 1 - i))) as u8;
            }
            bytes[0] |= marker;
            buf.put_slice(&bytes[..len]);
            return buf;
        }
    }
    unreachable!("u64 always fits in an 8-byte vint")
}

/// Encode the EBML "unknown size" marker for the given vint length (all data
/// bits set). Valid only for master elements the reader expects to scan by
/// child elements, per spec.md §4.1.
pub fn encode_unknown_size(len: usize) -> BytesMut {
    assert!((1..=MAX_VINT_LEN).contains(&len));
    let marker = 0x80u8 >> (len - 1);
    let mut bytes = vec![0xFFu8; len];
    let data_mask = if len == 8 { 0 } else { 0xFFu8 >> len };
    bytes[0] = marker | data_mask;
    BytesMut::from(&bytes[..])
}

/// Encode a 4-byte-or-shorter EBML element ID, given its raw on-wire value
/// (length-descriptor bits included, as returned by `decode_vint_raw_id`).
pub fn encode_id(id: u32, len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(len);
    for i in (0..len).rev() {
        buf.put_u8((id >> (8 * i)) as u8);
    }
    buf
}

/// Read an element header: `(id, size, unknown_size)`. `id` is the raw
/// on-wire ID value including its length-descriptor bits (element IDs carry
/// those bits as part of their identity, unlike sizes).
pub fn read_element_header(data: &[u8]) -> Result<(u32, u64, usize, bool), EbmlError> {
    let (id, id_len) = decode_vint_raw_id(data)?;
    let rest = &data[id_len..];
    let (size, size_len, unknown) = decode_vint(rest)?;
    Ok((id as u32, size, id_len + size_len, unknown))
}

/// Encode a big-endian unsigned integer, trimmed to the minimum number of
/// bytes that represent it (EBML uints are variable-width).
pub fn encode_uint(n: u64) -> Vec<u8> {
    if n == 0 {
        return vec![0];
    }
    let full = n.to_be_bytes();
    let first_nonzero = full.iter().position(|&b| b != 0).unwrap_or(7);
    full[first_nonzero..].to_vec()
}

/// Decode a big-endian unsigned integer of arbitrary (<=8) byte width.
pub fn decode_uint(data: &[u8]) -> Result<u64, EbmlError> {
    if data.is_empty() {
        return Ok(0);
    }
    if data.len() > 8 {
        return Err(EbmlError::IdTooLong);
    }
    let mut buf = [0u8; 8];
    buf[8 - data.len()..].copy_from_slice(data);
    Ok(u64::from_be_bytes(buf))
}

/// Decode a big-endian *signed* integer of arbitrary (<=8) byte width, used
/// for the cluster-relative SimpleBlock timecode in Matroska (spec.md §4.2
/// notes the cluster Timecode itself must be read unsigned, but block
/// timecodes are signed 16-bit).
pub fn decode_sint(data: &[u8]) -> Result<i64, EbmlError> {
    if data.is_empty() {
        return Ok(0);
    }
    if data.len() > 8 {
        return Err(EbmlError::IdTooLong);
    }
    let negative = data[0] & 0x80 != 0;
    let fill = if negative { 0xFFu8 } else { 0 };
    let mut buf = [fill; 8];
    buf[8 - data.len()..].copy_from_slice(data);
    Ok(i64::from_be_bytes(buf))
}

/// Decode an IEEE-754 float (4 or 8 bytes, the only widths EBML allows).
pub fn decode_float(data: &[u8]) -> Result<f64, EbmlError> {
    match data.len() {
        4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(data);
            Ok(f32::from_be_bytes(b) as f64)
        }
        8 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(data);
            Ok(f64::from_be_bytes(b))
        }
        _ => Err(EbmlError::UnexpectedEof),
    }
}

/// Decode an ASCII/UTF-8 string element (trailing NUL padding stripped).
pub fn decode_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Build a complete element: ID + size vint + payload.
pub fn encode_element(id: u32, id_len: usize, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(id_len + 9 + payload.len());
    buf.put_slice(&encode_id(id, id_len));
    buf.put_slice(&encode_vint(payload.len() as u64));
    buf.put_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vint_roundtrip_single_byte() {
        let encoded = encode_vint(42);
        assert_eq!(encoded.len(), 1);
        let (value, len, unknown) = decode_vint(&encoded).unwrap();
        assert_eq!(value, 42);
        assert_eq!(len, 1);
        assert!(!unknown);
    }

    #[test]
    fn vint_roundtrip_multi_byte() {
        for n in [127u64, 128, 16383, 16384, 2_097_151, 2_097_152, 10_000_000] {
            let encoded = encode_vint(n);
            let (value, len, _) = decode_vint(&encoded).unwrap();
            assert_eq!(value, n, "n={n}");
            assert_eq!(len, encoded.len());
        }
    }

    #[test]
    fn vint_length_prefix_bit_pattern() {
        // 1-byte: 0x80 marker: values 0..=0x7F
        let (v, len, _) = decode_vint(&[0x81]).unwrap();
        assert_eq!((v, len), (1, 1));
        // 2-byte: 0x40 marker
        let (v, len, _) = decode_vint(&[0x40, 0x01]).unwrap();
        assert_eq!((v, len), (1, 2));
        // 3-byte: 0x20 marker
        let (v, len, _) = decode_vint(&[0x20, 0x00, 0x01]).unwrap();
        assert_eq!((v, len), (1, 3));
    }

    #[test]
    fn vint_unknown_size_detected() {
        let unknown = encode_unknown_size(1);
        let (_, len, is_unknown) = decode_vint(&unknown).unwrap();
        assert_eq!(len, 1);
        assert!(is_unknown);

        let unknown8 = encode_unknown_size(8);
        let (_, len8, is_unknown8) = decode_vint(&unknown8).unwrap();
        assert_eq!(len8, 8);
        assert!(is_unknown8);
    }

    #[test]
    fn vint_zero_first_byte_is_error() {
        assert_eq!(
            decode_vint(&[0x00, 0x01]).unwrap_err(),
            EbmlError::InvalidLengthDescriptor(0)
        );
    }

    #[test]
    fn vint_truncated_is_error() {
        // 0x20 marker claims 3 bytes, only 2 given
        match decode_vint(&[0x20, 0x01]) {
            Err(EbmlError::TruncatedVint { need: 3, have: 2 }) => {}
            other => panic!("expected TruncatedVint, got {other:?}"),
        }
    }

    #[test]
    fn vint_empty_is_error() {
        assert_eq!(decode_vint(&[]).unwrap_err(), EbmlError::EmptyVint);
    }

    #[test]
    fn element_id_rejects_leading_zero_byte() {
        assert_eq!(
            decode_vint_raw_id(&[0x00, 0x01, 0x02]).unwrap_err(),
            EbmlError::InvalidIdFirstByte
        );
    }

    #[test]
    fn element_id_up_to_four_bytes() {
        // Segment ID: 0x18538067 (4 bytes, 0x10 length descriptor)
        let id_bytes = [0x18, 0x53, 0x80, 0x67];
        let (id, len) = decode_vint_raw_id(&id_bytes).unwrap();
        assert_eq!(len, 4);
        assert_eq!(id, 0x1853_8067);
    }

    #[test]
    fn element_header_roundtrip() {
        let payload = b"matroska";
        let elem = encode_element(0x4282, 2, payload); // DocType, 2-byte id form
        let (id, size, header_len, unknown) = read_element_header(&elem).unwrap();
        assert_eq!(id, 0x4282);
        assert_eq!(size, payload.len() as u64);
        assert!(!unknown);
        assert_eq!(&elem[header_len..], payload);
    }

    #[test]
    fn uint_roundtrip() {
        for n in [0u64, 1, 255, 256, 65535, 1_000_000, u64::MAX] {
            let encoded = encode_uint(n);
            assert_eq!(decode_uint(&encoded).unwrap(), n);
        }
    }

    #[test]
    fn sint_handles_negative() {
        // -100 as a 2-byte big-endian two's complement value
        let bytes = (-100i16).to_be_bytes();
        assert_eq!(decode_sint(&bytes).unwrap(), -100);
    }

    #[test]
    fn sint_handles_positive() {
        let bytes = (12345i32).to_be_bytes();
        assert_eq!(decode_sint(&bytes).unwrap(), 12345);
    }

    #[test]
    fn float_decodes_both_widths() {
        let f32_bytes = 3.5f32.to_be_bytes();
        assert_eq!(decode_float(&f32_bytes).unwrap(), 3.5);
        let f64_bytes = 3.5f64.to_be_bytes();
        assert_eq!(decode_float(&f64_bytes).unwrap(), 3.5);
    }

    #[test]
    fn string_strips_nul_padding() {
        assert_eq!(decode_string(b"matroska\0\0\0"), "matroska");
        assert_eq!(decode_string(b"no-padding"), "no-padding");
    }
}
