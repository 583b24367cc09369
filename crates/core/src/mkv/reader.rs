//! Lazy Matroska reader: parses a byte stream into a sequence of
//! timestamped [`Frame`]s, pushed onto a bounded channel as they're decoded.
//!
//! Structure follows `beam-protocol::frame::VideoFrameHeader::deserialize`'s
//! validate-then-parse shape, generalized from a fixed 24-byte header to
//! Matroska's nested, variable-length element framing. Maintains a stack of
//! open master containers with byte-offset end markers, popping a container
//! once the read offset reaches or passes its end (spec.md §4.2).

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ebml;
use crate::error::ContainerError;
use crate::mkv::ids;
use crate::mkv::{AudioTrackInfo, Frame, TrackEntry, TrackKind, VideoTrackInfo};

/// How long the reader will block trying to push a decoded frame onto the
/// emission channel before surfacing backpressure as an error (spec.md §4.2).
const EMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A single open master element on the container stack.
struct OpenMaster {
    id: u32,
    /// Absolute byte offset (from stream start) where this element ends.
    /// `None` for unknown-size elements (Segment), which close only at EOF.
    end_offset: Option<u64>,
}

/// Parses one Matroska stream and emits [`Frame`]s on `tx` as they are read.
pub struct MkvReader<R> {
    inner: R,
    buf: BytesMut,
    /// Total bytes consumed from `inner` so far (absolute stream offset).
    offset: u64,
    stack: Vec<OpenMaster>,
    tracks: Vec<TrackEntry>,
    timecode_scale: u64,
    /// Current cluster's base timecode in ticks (read as unsigned, per
    /// spec.md §4.2 — a signed read would cause PTS rewind above 32767ms).
    cluster_timecode: u64,
    /// Per-track running Opus lacing offset (ms) within the current laced
    /// SimpleBlock, so consecutive laced Opus frames advance by estimated
    /// packet duration rather than sharing one timestamp.
}

impl<R: tokio::io::AsyncRead + Unpin> MkvReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            offset: 0,
            stack: Vec::new(),
            tracks: Vec::new(),
            timecode_scale: 1_000_000,
            cluster_timecode: 0,
        }
    }

    pub fn tracks(&self) -> &[TrackEntry] {
        &self.tracks
    }

    /// Ensure at least `n` bytes are available in `self.buf`, reading more
    /// from `inner` as needed. Returns `Ok(false)` on clean EOF with no more
    /// data available (only valid when `n` bytes were not already at hand).
    async fn fill(&mut self, n: usize) -> Result<bool, ContainerError> {
        while self.buf.len() < n {
            let mut chunk = [0u8; 8192];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                return Ok(false);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
        Ok(true)
    }

    async fn read_bytes(&mut self, n: usize) -> Result<BytesMut, ContainerError> {
        if !self.fill(n).await? {
            return Err(ContainerError::TruncatedBlock {
                expected: n,
                actual: self.buf.len(),
            });
        }
        let out = self.buf.split_to(n);
        self.offset += n as u64;
        Ok(out)
    }

    /// Read one element header without consuming the payload.
    async fn peek_header(&mut self) -> Result<Option<(u32, u64, usize, bool)>, ContainerError> {
        // An ID is at most 4 bytes, a size vint at most 8: 12 bytes is
        // always enough to decode a header, but we tolerate a shorter
        // buffer at true EOF.
        if !self.fill(1).await? {
            return Ok(None);
        }
        // Grow until we can parse a full header or hit EOF.
        loop {
            match ebml::read_element_header(&self.buf) {
                Ok(header) => return Ok(Some(header)),
                Err(crate::error::EbmlError::TruncatedVint { need, .. }) => {
                    if !self.fill(need + 4).await? {
                        return Err(ContainerError::Ebml(crate::error::EbmlError::UnexpectedEof));
                    }
                }
                Err(e) => return Err(ContainerError::Ebml(e)),
            }
        }
    }

    async fn consume_header(&mut self, header_len: usize) -> Result<(), ContainerError> {
        self.read_bytes(header_len).await.map(|_| ())
    }

    /// Pop any master elements whose end offset has been reached or passed.
    fn pop_closed_masters(&mut self) {
        while let Some(top) = self.stack.last() {
            match top.end_offset {
                Some(end) if self.offset >= end => {
                    self.stack.pop();
                }
                _ => break,
            }
        }
    }

    /// Parse the EBML header and Segment/Info/Tracks preamble. Must be
    /// called before the first call to `next_frame`.
    pub async fn read_headers(&mut self) -> Result<(), ContainerError> {
        loop {
            self.pop_closed_masters();
            let Some((id, size, header_len, unknown)) = self.peek_header().await? else {
                return Ok(());
            };

            if id == ids::EBML {
                self.consume_header(header_len).await?;
                let payload = self.read_bytes(size as usize).await?;
                self.parse_ebml_header(&payload)?;
                continue;
            }

            if id == ids::SEGMENT {
                self.consume_header(header_len).await?;
                let end_offset = if unknown {
                    None
                } else {
                    Some(self.offset + size)
                };
                self.stack.push(OpenMaster {
                    id,
                    end_offset,
                });
                continue;
            }

            if self.stack.iter().any(|m| m.id == ids::SEGMENT) {
                if id == ids::INFO {
                    self.consume_header(header_len).await?;
                    let payload = self.read_bytes(size as usize).await?;
                    self.parse_info(&payload)?;
                    continue;
                }
                if id == ids::TRACKS {
                    self.consume_header(header_len).await?;
                    let payload = self.read_bytes(size as usize).await?;
                    self.parse_tracks(&payload)?;
                    // Headers fully read: the Cluster loop (next_frame)
                    // takes over from here.
                    return Ok(());
                }
            }

            // Anything else at this stage is skipped outright.
            self.consume_header(header_len).await?;
            self.read_bytes(size as usize).await?;
        }
    }

    fn parse_ebml_header(&mut self, payload: &[u8]) -> Result<(), ContainerError> {
        walk_children(payload, |id, body| {
            if id == ids::DOC_TYPE {
                debug!(doc_type = %ebml::decode_string(body), "EBML header");
            }
            Ok(())
        })
    }

    fn parse_info(&mut self, payload: &[u8]) -> Result<(), ContainerError> {
        walk_children(payload, |id, body| {
            if id == ids::TIMECODE_SCALE {
                self.timecode_scale = ebml::decode_uint(body)
                    .map_err(ContainerError::Ebml)?
                    .max(1);
            }
            Ok(())
        })
    }

    fn parse_tracks(&mut self, payload: &[u8]) -> Result<(), ContainerError> {
        let mut offset = 0usize;
        while offset < payload.len() {
            let (id, size, header_len, _) = ebml::read_element_header(&payload[offset..])
                .map_err(ContainerError::Ebml)?;
            let body_start = offset + header_len;
            let body_end = body_start + size as usize;
            if body_end > payload.len() {
                return Err(ContainerError::SizeMismatch(
                    "TrackEntry payload runs past Tracks element end".into(),
                ));
            }
            if id == ids::TRACK_ENTRY {
                self.tracks.push(parse_track_entry(&payload[body_start..body_end])?);
            }
            offset = body_end;
        }
        Ok(())
    }

    /// Read the next frame from the stream, or `None` on clean EOF.
    ///
    /// Pushes the frame onto `tx`, enforcing a 5-second send-timeout so a
    /// stalled consumer surfaces as backpressure rather than hanging forever
    /// (spec.md §4.2 emission contract). Because lacing can expand one
    /// SimpleBlock into several frames, this reads and emits a whole laced
    /// group in one call.
    pub async fn read_frames_into(
        &mut self,
        tx: &mpsc::Sender<Frame>,
    ) -> Result<bool, ContainerError> {
        loop {
            self.pop_closed_masters();
            let Some((id, size, header_len, unknown)) = self.peek_header().await? else {
                return Ok(false);
            };

            if id == ids::CLUSTER {
                self.consume_header(header_len).await?;
                let end_offset = if unknown {
                    None
                } else {
                    Some(self.offset + size)
                };
                self.stack.push(OpenMaster { id, end_offset });
                continue;
            }

            let in_cluster = self.stack.last().map(|m| m.id) == Some(ids::CLUSTER);

            if in_cluster && id == ids::TIMECODE {
                self.consume_header(header_len).await?;
                let payload = self.read_bytes(size as usize).await?;
                // MUST be read as unsigned (spec.md §4.2, §9 open question).
                self.cluster_timecode =
                    ebml::decode_uint(&payload).map_err(ContainerError::Ebml)?;
                continue;
            }

            if in_cluster && id == ids::SIMPLE_BLOCK {
                self.consume_header(header_len).await?;
                let payload = self.read_bytes(size as usize).await?;
                let frames = self.parse_simple_block(&payload)?;
                let emitted = !frames.is_empty();
                for frame in frames {
                    send_with_timeout(tx, frame).await?;
                }
                if emitted {
                    return Ok(true);
                }
                continue;
            }

            // Anything else (unrecognized leaf, BlockGroup wrapper we don't
            // special-case, etc.) is skipped.
            self.consume_header(header_len).await?;
            if id == ids::BLOCK_GROUP {
                // Re-enter as a master so its nested Block is visited.
                self.stack.push(OpenMaster {
                    id,
                    end_offset: Some(self.offset + size),
                });
                continue;
            }
            self.read_bytes(size as usize).await?;
        }
    }

    fn parse_simple_block(&mut self, data: &[u8]) -> Result<Vec<Frame>, ContainerError> {
        if data.len() < 4 {
            return Err(ContainerError::TruncatedBlock {
                expected: 4,
                actual: data.len(),
            });
        }
        let (track_number, vint_len) =
            ebml::decode_vint(data).map(|(v, l, _)| (v, l)).map_err(ContainerError::Ebml)?;
        let rest = &data[vint_len..];
        if rest.len() < 3 {
            return Err(ContainerError::TruncatedBlock {
                expected: 3,
                actual: rest.len(),
            });
        }
        let relative_tc = i16::from_be_bytes([rest[0], rest[1]]);
        let flags = rest[2];
        let is_keyframe = flags & 0x80 != 0;
        let lacing = (flags & 0x06) >> 1;
        let body = &rest[3..];

        let cluster_ms = crate::timebase::ticks_to_ms(self.cluster_timecode, self.timecode_scale);
        let base_ms = cluster_ms as i64 + relative_tc as i64;

        let track = self
            .tracks
            .iter()
            .find(|t| t.track_number == track_number)
            .cloned();
        let kind = track.as_ref().map(|t| t.kind).unwrap_or(TrackKind::Video);
        let is_opus = track
            .as_ref()
            .map(|t| t.codec_id == "A_OPUS")
            .unwrap_or(false);

        let payloads = split_laced_frames(lacing, body)?;

        let mut frames = Vec::with_capacity(payloads.len());
        let mut running_ms = base_ms;
        for payload in payloads {
            let duration_ms = if is_opus {
                opus_packet_duration_ms(&payload)
            } else {
                0
            };
            frames.push(Frame {
                kind,
                payload: bytes::Bytes::from(payload),
                timestamp_ms: running_ms,
                is_keyframe,
                cluster_time_ms: cluster_ms as i64,
                block_relative_ms: relative_tc as i32,
            });
            running_ms += duration_ms as i64;
        }
        Ok(frames)
    }
}

async fn send_with_timeout(
    tx: &mpsc::Sender<Frame>,
    frame: Frame,
) -> Result<(), ContainerError> {
    match tokio::time::timeout(EMIT_TIMEOUT, tx.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => {
            warn!("frame emission channel closed, stopping reader");
            Err(ContainerError::SendTimeout(EMIT_TIMEOUT))
        }
        Err(_) => Err(ContainerError::SendTimeout(EMIT_TIMEOUT)),
    }
}

/// Walk top-level children of a master element's payload, invoking `f` with
/// each child's ID and body.
fn walk_children(
    payload: &[u8],
    mut f: impl FnMut(u32, &[u8]) -> Result<(), ContainerError>,
) -> Result<(), ContainerError> {
    let mut offset = 0usize;
    while offset < payload.len() {
        let (id, size, header_len, _) =
            ebml::read_element_header(&payload[offset..]).map_err(ContainerError::Ebml)?;
        let body_start = offset + header_len;
        let body_end = body_start + size as usize;
        if body_end > payload.len() {
            return Err(ContainerError::SizeMismatch(format!(
                "child element 0x{id:x} runs past parent end"
            )));
        }
        f(id, &payload[body_start..body_end])?;
        offset = body_end;
    }
    Ok(())
}

fn parse_track_entry(payload: &[u8]) -> Result<TrackEntry, ContainerError> {
    let mut track_number = 0u64;
    let mut track_type = 0u64;
    let mut codec_id = String::new();
    let mut video = None;
    let mut audio = None;

    let mut offset = 0usize;
    while offset < payload.len() {
        let (id, size, header_len, _) =
            ebml::read_element_header(&payload[offset..]).map_err(ContainerError::Ebml)?;
        let body_start = offset + header_len;
        let body_end = body_start + size as usize;
        if body_end > payload.len() {
            return Err(ContainerError::SizeMismatch(
                "TrackEntry child runs past TrackEntry end".into(),
            ));
        }
        let body = &payload[body_start..body_end];
        match id {
            ids::TRACK_NUMBER => {
                track_number = ebml::decode_uint(body).map_err(ContainerError::Ebml)?
            }
            ids::TRACK_TYPE => {
                track_type = ebml::decode_uint(body).map_err(ContainerError::Ebml)?
            }
            ids::CODEC_ID => codec_id = ebml::decode_string(body),
            ids::VIDEO => video = Some(parse_video_settings(body)?),
            ids::AUDIO => audio = Some(parse_audio_settings(body)?),
            _ => {}
        }
        offset = body_end;
    }

    let kind = if track_type == ids::TRACK_TYPE_AUDIO {
        TrackKind::Audio
    } else {
        TrackKind::Video
    };

    Ok(TrackEntry {
        track_number,
        kind,
        codec_id,
        video,
        audio,
    })
}

fn parse_video_settings(payload: &[u8]) -> Result<VideoTrackInfo, ContainerError> {
    let mut info = VideoTrackInfo::default();
    walk_children(payload, |id, body| {
        match id {
            ids::PIXEL_WIDTH => info.pixel_width = ebml::decode_uint(body)? as u32,
            ids::PIXEL_HEIGHT => info.pixel_height = ebml::decode_uint(body)? as u32,
            ids::COLOUR_SPACE => info.colour_space = String::from_utf8_lossy(body).into_owned(),
            ids::BIT_DEPTH => info.bit_depth = ebml::decode_uint(body)? as u8,
            _ => {}
        }
        Ok(())
    })
    .map(|_| info)
}

fn parse_audio_settings(payload: &[u8]) -> Result<AudioTrackInfo, ContainerError> {
    let mut info = AudioTrackInfo::default();
    walk_children(payload, |id, body| {
        match id {
            ids::SAMPLING_FREQUENCY => info.sample_rate = ebml::decode_float(body)?,
            ids::CHANNELS => info.channels = ebml::decode_uint(body)? as u16,
            ids::BIT_DEPTH => info.bit_depth = ebml::decode_uint(body)? as u8,
            _ => {}
        }
        Ok(())
    })
    .map(|_| info)
}

/// Split a SimpleBlock body into one payload per laced frame (spec.md
/// §4.2). Lacing mode 0 = none (single frame), 1 = Xiph, 2 = fixed, 3 = EBML.
fn split_laced_frames(lacing: u8, body: &[u8]) -> Result<Vec<Vec<u8>>, ContainerError> {
    if lacing == 0 {
        return Ok(vec![body.to_vec()]);
    }
    if body.is_empty() {
        return Err(ContainerError::TruncatedBlock {
            expected: 1,
            actual: 0,
        });
    }
    let frame_count = body[0] as usize + 1;
    let mut cursor = 1usize;

    let sizes: Vec<usize> = match lacing {
        1 => {
            // Xiph lacing: frame_count - 1 sizes, each a sequence of 255
            // continuations, last laced frame's size is implicit.
            let mut sizes = Vec::with_capacity(frame_count - 1);
            for _ in 0..frame_count - 1 {
                let mut size = 0usize;
                loop {
                    let b = *body.get(cursor).ok_or(ContainerError::TruncatedBlock {
                        expected: cursor + 1,
                        actual: body.len(),
                    })?;
                    cursor += 1;
                    size += b as usize;
                    if b != 255 {
                        break;
                    }
                }
                sizes.push(size);
            }
            sizes
        }
        2 => {
            // Fixed lacing: remaining bytes divided equally.
            let remaining = body.len() - cursor;
            if remaining % frame_count != 0 {
                return Err(ContainerError::SizeMismatch(
                    "fixed lacing remainder not divisible by frame count".into(),
                ));
            }
            vec![remaining / frame_count; frame_count - 1]
        }
        3 => {
            // EBML lacing: one vint size, then signed-delta vints.
            let mut sizes = Vec::with_capacity(frame_count - 1);
            let (first_size, first_len, _) =
                ebml::decode_vint(&body[cursor..]).map_err(ContainerError::Ebml)?;
            cursor += first_len;
            let mut prev = first_size as i64;
            sizes.push(first_size as usize);
            for _ in 1..frame_count - 1 {
                let (raw, len, _) =
                    ebml::decode_vint(&body[cursor..]).map_err(ContainerError::Ebml)?;
                cursor += len;
                // EBML lacing deltas are signed, range-shifted; bias is
                // 2^(7*len-1) - 1 per the spec. We only need relative sizes
                // to stay monotonic-safe here so we decode via decode_sint
                // semantics applied to the vint payload width.
                let bias = (1i64 << (7 * len - 1)) - 1;
                let delta = raw as i64 - bias;
                prev += delta;
                if prev < 0 {
                    return Err(ContainerError::SizeMismatch(
                        "EBML lacing delta produced negative size".into(),
                    ));
                }
                sizes.push(prev as usize);
            }
            sizes
        }
        _ => unreachable!("lacing is masked to 2 bits"),
    };

    let mut frames = Vec::with_capacity(frame_count);
    let mut pos = cursor;
    for &size in &sizes {
        let end = pos + size;
        if end > body.len() {
            return Err(ContainerError::TruncatedBlock {
                expected: end,
                actual: body.len(),
            });
        }
        frames.push(body[pos..end].to_vec());
        pos = end;
    }
    // Last laced frame takes whatever remains.
    frames.push(body[pos..].to_vec());
    Ok(frames)
}

/// Estimate an Opus frame's duration in milliseconds from its TOC byte
/// (spec.md §4.2): config index selects SILK/Hybrid/CELT mode and base
/// duration; the frame-code field (low 2 bits) can multiply it, but for
/// lacing-advance purposes only the per-frame base duration matters since
/// each laced entry is already one Opus packet.
fn opus_packet_duration_ms(packet: &[u8]) -> u32 {
    let Some(&toc) = packet.first() else {
        return 20;
    };
    let config = toc >> 3;
    match config {
        0..=11 => {
            // SILK/Hybrid: 10/20/40/60 ms cycling over groups of 4 configs.
            match config % 4 {
                0 => 10,
                1 => 20,
                2 => 40,
                _ => 60,
            }
        }
        12..=15 => {
            // Hybrid wideband: 10/20 ms.
            if config % 2 == 0 { 10 } else { 20 }
        }
        16.. => {
            // CELT-only: 2.5/5/10/20 ms.
            match config % 4 {
                0 => 2,
                1 => 5,
                2 => 10,
                _ => 20,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_lacing_splits_equally() {
        let body = {
            let mut b = vec![2u8]; // frame_count - 1 = 2 -> 3 frames
            b.extend_from_slice(&[1, 2, 3, 4, 5, 6]); // 6 bytes / 3 = 2 each
            b
        };
        let frames = split_laced_frames(2, &body).unwrap();
        assert_eq!(frames, vec![vec![1, 2], vec![3, 4], vec![5, 6]]);
    }

    #[test]
    fn xiph_lacing_decodes_255_continuations() {
        // frame_count = 2 -> one size byte needed (for frame 0); 255 + 10 = 265 bytes.
        let mut body = vec![1u8]; // frame_count - 1 = 1
        body.push(255);
        body.push(10);
        body.extend(std::iter::repeat_n(0xAAu8, 265));
        body.extend(std::iter::repeat_n(0xBBu8, 5)); // remainder for last laced frame
        let frames = split_laced_frames(1, &body).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 265);
        assert_eq!(frames[1].len(), 5);
    }

    #[test]
    fn no_lacing_returns_single_frame() {
        let body = vec![1, 2, 3, 4];
        let frames = split_laced_frames(0, &body).unwrap();
        assert_eq!(frames, vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn opus_toc_silk_10ms() {
        // config=0 -> toc byte = 0b00000_0_00 = 0x00
        assert_eq!(opus_packet_duration_ms(&[0x00]), 10);
    }

    #[test]
    fn opus_toc_celt_20ms() {
        // config=19 -> toc byte = 19 << 3 = 0x98
        assert_eq!(opus_packet_duration_ms(&[0x98]), 20);
    }

    #[test]
    fn cluster_timecode_unsigned_no_rewind() {
        // Cluster timecode 33000 with block relative offsets -100, 0, +100
        // must yield 32900, 33000, 33100 -- never negative (spec.md §8.2).
        let cluster_ms = crate::timebase::ticks_to_ms(33_000, 1_000_000) as i64;
        assert_eq!(cluster_ms + (-100i64), 32_900);
        assert_eq!(cluster_ms + 0, 33_000);
        assert_eq!(cluster_ms + 100, 33_100);
    }
}
