//! Matroska writer: two tracks (video + optional audio) muxed into a single
//! unknown-size Segment, clusters opened on keyframe or time boundary.
//!
//! Shares the "serialize a fixed header, then append records" shape of
//! `beam-protocol::frame::VideoFrameHeader::serialize`, generalized to a
//! nested element tree. Video and audio frames can arrive from independent
//! pipeline tasks, so the mutable muxing state lives behind a single
//! `tokio::sync::Mutex` — this also doubles as the first-writer-wins gate for
//! the shared base timestamp (spec.md §9 open question 5).

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::ebml;
use crate::error::ContainerError;
use crate::mkv::ids;

/// New cluster is opened once a keyframe arrives or this many ms have
/// elapsed since the current cluster started (spec.md §4.2).
const CLUSTER_MAX_DURATION_MS: i64 = 1000;

/// The underlying writer is flushed once a keyframe is written or this many
/// ms have elapsed since the last flush (spec.md §4.2).
const FLUSH_INTERVAL_MS: i64 = 100;

pub const VIDEO_TRACK_NUMBER: u64 = 1;
pub const AUDIO_TRACK_NUMBER: u64 = 2;

/// Static track metadata supplied once at writer construction. Pixel
/// dimensions are not known until the first accepted video frame decodes
/// (spec.md §6: "at decoded resolution"), so they're captured lazily via
/// `write_video_frame`'s `width`/`height` arguments instead of living here.
pub struct TrackConfig {
    pub video_codec_id: &'static str,
    pub colour_space: &'static str,
    /// BitsPerChannel for the video track (spec.md §6: 8 for RGBA output).
    pub bit_depth: u8,
    pub audio: Option<AudioConfig>,
}

pub struct AudioConfig {
    pub codec_id: &'static str,
    pub sample_rate: f64,
    pub channels: u16,
}

struct Inner<W> {
    out: W,
    headers_written: bool,
    base_ms: Option<i64>,
    cluster_open: bool,
    cluster_start_ms: i64,
    last_flush_ms: i64,
    /// Decoded video resolution, captured from the first `write_video_frame`
    /// call that precedes header emission (first-writer-wins, same pattern
    /// as `base_ms`).
    video_dimensions: Option<(u32, u32)>,
}

/// Muxes video (and optionally audio) frames into Matroska on an
/// `AsyncWrite` sink. Safe to call `write_video_frame`/`write_audio_frame`
/// from different tasks concurrently.
pub struct MkvWriter<W> {
    inner: Mutex<Inner<W>>,
    config: TrackConfig,
}

impl<W: AsyncWrite + Unpin> MkvWriter<W> {
    pub fn new(out: W, config: TrackConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                out,
                headers_written: false,
                base_ms: None,
                cluster_open: false,
                cluster_start_ms: 0,
                last_flush_ms: 0,
                video_dimensions: None,
            }),
            config,
        }
    }

    /// `width`/`height` are the decoded resolution (spec.md §6); only the
    /// value captured before headers are first emitted ends up in the
    /// Tracks element, matching the `base_ms` first-writer-wins pattern.
    pub async fn write_video_frame(
        &self,
        timestamp_ms: i64,
        is_keyframe: bool,
        width: u32,
        height: u32,
        payload: &[u8],
    ) -> Result<(), ContainerError> {
        {
            let mut guard = self.inner.lock().await;
            if !guard.headers_written {
                guard.video_dimensions.get_or_insert((width, height));
            }
        }
        self.write_frame(VIDEO_TRACK_NUMBER, timestamp_ms, is_keyframe, payload)
            .await
    }

    pub async fn write_audio_frame(
        &self,
        timestamp_ms: i64,
        payload: &[u8],
    ) -> Result<(), ContainerError> {
        // Audio never carries a keyframe flag; treat every frame as
        // non-keying for cluster-boundary purposes.
        self.write_frame(AUDIO_TRACK_NUMBER, timestamp_ms, false, payload)
            .await
    }

    async fn write_frame(
        &self,
        track_number: u64,
        timestamp_ms: i64,
        is_keyframe: bool,
        payload: &[u8],
    ) -> Result<(), ContainerError> {
        let mut guard = self.inner.lock().await;

        if !guard.headers_written {
            let dimensions = guard.video_dimensions.unwrap_or((0, 0));
            let header = build_headers(&self.config, dimensions);
            guard.out.write_all(&header).await?;
            guard.headers_written = true;
        }

        let base_ms = *guard.base_ms.get_or_insert(timestamp_ms);
        let rebased_ms = timestamp_ms - base_ms;

        let mut relative_ms = rebased_ms - guard.cluster_start_ms;
        let needs_new_cluster = !guard.cluster_open
            || is_keyframe
            || relative_ms > CLUSTER_MAX_DURATION_MS
            || relative_ms < i16::MIN as i64
            || relative_ms > i16::MAX as i64;

        if needs_new_cluster {
            // Unknown-size clusters need no closing element; the next
            // Cluster ID simply terminates the previous one's scan.
            let cluster_header = encode_cluster_start(rebased_ms);
            guard.out.write_all(&cluster_header).await?;
            guard.cluster_open = true;
            guard.cluster_start_ms = rebased_ms;
            relative_ms = 0;
        }

        if !(i16::MIN as i64..=i16::MAX as i64).contains(&relative_ms) {
            return Err(ContainerError::SizeMismatch(format!(
                "block-relative timecode {relative_ms} exceeds i16 range after cluster reset"
            )));
        }

        let block = encode_simple_block(track_number, relative_ms as i16, is_keyframe, payload);
        guard.out.write_all(&block).await?;

        let since_flush = rebased_ms - guard.last_flush_ms;
        if is_keyframe || since_flush > FLUSH_INTERVAL_MS {
            guard.out.flush().await?;
            guard.last_flush_ms = rebased_ms;
        }

        debug!(track_number, timestamp_ms, is_keyframe, len = payload.len(), "wrote mkv frame");
        Ok(())
    }

    /// Flush any buffered bytes. The Segment and all Clusters are
    /// unknown-size, so there is no trailer to write — finalizing just
    /// ensures every byte reaches the sink (spec.md §4.2).
    pub async fn finalize(&self) -> Result<(), ContainerError> {
        let mut guard = self.inner.lock().await;
        guard.out.flush().await?;
        Ok(())
    }
}

/// Build the fixed EBML header + Segment start + Info + Tracks prelude.
/// Written exactly once, at the first frame (spec.md §4.1, §4.2).
fn build_headers(config: &TrackConfig, video_dimensions: (u32, u32)) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);

    // EBML header: DocType "matroska", DocTypeVersion/DocTypeReadVersion 4.
    let ebml_body = {
        let mut b = Vec::new();
        b.extend_from_slice(&ebml::encode_element(ids::EBML_VERSION, 2, &ebml::encode_uint(1)));
        b.extend_from_slice(&ebml::encode_element(ids::EBML_READ_VERSION, 2, &ebml::encode_uint(1)));
        b.extend_from_slice(&ebml::encode_element(ids::EBML_MAX_ID_LENGTH, 2, &ebml::encode_uint(4)));
        b.extend_from_slice(&ebml::encode_element(ids::EBML_MAX_SIZE_LENGTH, 2, &ebml::encode_uint(8)));
        b.extend_from_slice(&ebml::encode_element(ids::DOC_TYPE, 2, b"matroska\0"));
        b.extend_from_slice(&ebml::encode_element(ids::DOC_TYPE_VERSION, 2, &ebml::encode_uint(4)));
        b.extend_from_slice(&ebml::encode_element(ids::DOC_TYPE_READ_VERSION, 2, &ebml::encode_uint(4)));
        b
    };
    buf.extend_from_slice(&ebml::encode_element(ids::EBML, 4, &ebml_body));

    // Segment: unknown size, so header/children are appended directly after
    // this ID + unknown-size vint rather than a length-prefixed payload.
    buf.extend_from_slice(&ebml::encode_id(ids::SEGMENT, 4));
    buf.extend_from_slice(&ebml::encode_unknown_size(8));

    let info_body = {
        let mut b = Vec::new();
        b.extend_from_slice(&ebml::encode_element(
            ids::TIMECODE_SCALE,
            3,
            &ebml::encode_uint(1_000_000),
        ));
        b.extend_from_slice(&ebml::encode_element(ids::MUXING_APP, 2, b"rtcbridge\0"));
        b.extend_from_slice(&ebml::encode_element(ids::WRITING_APP, 2, b"rtcbridge\0"));
        b
    };
    buf.extend_from_slice(&ebml::encode_element(ids::INFO, 4, &info_body));

    let video_track = {
        let mut b = Vec::new();
        b.extend_from_slice(&ebml::encode_element(
            ids::TRACK_NUMBER,
            1,
            &ebml::encode_uint(VIDEO_TRACK_NUMBER),
        ));
        b.extend_from_slice(&ebml::encode_element(
            ids::TRACK_TYPE,
            1,
            &ebml::encode_uint(ids::TRACK_TYPE_VIDEO),
        ));
        let codec_id = format!("{}\0", config.video_codec_id);
        b.extend_from_slice(&ebml::encode_element(ids::CODEC_ID, 1, codec_id.as_bytes()));
        let video_body = {
            let (width, height) = video_dimensions;
            let mut vb = Vec::new();
            vb.extend_from_slice(&ebml::encode_element(ids::PIXEL_WIDTH, 1, &ebml::encode_uint(width as u64)));
            vb.extend_from_slice(&ebml::encode_element(ids::PIXEL_HEIGHT, 1, &ebml::encode_uint(height as u64)));
            let colour = format!("{}\0", config.colour_space);
            vb.extend_from_slice(&ebml::encode_element(ids::COLOUR_SPACE, 3, colour.as_bytes()));
            vb.extend_from_slice(&ebml::encode_element(
                ids::BIT_DEPTH,
                2,
                &ebml::encode_uint(config.bit_depth as u64),
            ));
            vb
        };
        b.extend_from_slice(&ebml::encode_element(ids::VIDEO, 1, &video_body));
        ebml::encode_element(ids::TRACK_ENTRY, 1, &b)
    };

    let mut tracks_body = video_track.to_vec();

    if let Some(audio) = &config.audio {
        let audio_track = {
            let mut b = Vec::new();
            b.extend_from_slice(&ebml::encode_element(
                ids::TRACK_NUMBER,
                1,
                &ebml::encode_uint(AUDIO_TRACK_NUMBER),
            ));
            b.extend_from_slice(&ebml::encode_element(
                ids::TRACK_TYPE,
                1,
                &ebml::encode_uint(ids::TRACK_TYPE_AUDIO),
            ));
            let codec_id = format!("{}\0", audio.codec_id);
            b.extend_from_slice(&ebml::encode_element(ids::CODEC_ID, 1, codec_id.as_bytes()));
            let mut sample_rate_bytes = [0u8; 8];
            sample_rate_bytes.copy_from_slice(&audio.sample_rate.to_be_bytes());
            let audio_body = {
                let mut ab = Vec::new();
                ab.extend_from_slice(&ebml::encode_element(ids::SAMPLING_FREQUENCY, 1, &sample_rate_bytes));
                ab.extend_from_slice(&ebml::encode_element(
                    ids::CHANNELS,
                    1,
                    &ebml::encode_uint(audio.channels as u64),
                ));
                ab
            };
            b.extend_from_slice(&ebml::encode_element(ids::AUDIO, 1, &audio_body));
            ebml::encode_element(ids::TRACK_ENTRY, 1, &b)
        };
        tracks_body.extend_from_slice(&audio_track);
    }

    buf.extend_from_slice(&ebml::encode_element(ids::TRACKS, 4, &tracks_body));
    buf
}

/// Emit a Cluster ID + unknown-size marker + its Timecode leaf. Matches the
/// fixed layout `reader.rs` expects (Timecode immediately inside Cluster,
/// read as unsigned).
fn encode_cluster_start(cluster_ms: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&ebml::encode_id(ids::CLUSTER, 4));
    buf.extend_from_slice(&ebml::encode_unknown_size(8));
    buf.extend_from_slice(&ebml::encode_element(
        ids::TIMECODE,
        1,
        &ebml::encode_uint(cluster_ms.max(0) as u64),
    ));
    buf
}

/// Encode an unlaced SimpleBlock: vint track number + 16-bit relative
/// timecode + flags byte (bit 0x80 keyframe, lacing bits left at 0 -- this
/// writer never emits laced blocks).
fn encode_simple_block(track_number: u64, relative_ms: i16, is_keyframe: bool, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.extend_from_slice(&ebml::encode_vint(track_number));
    body.extend_from_slice(&relative_ms.to_be_bytes());
    let flags = if is_keyframe { 0x80u8 } else { 0x00 };
    body.push(flags);
    body.extend_from_slice(payload);
    ebml::encode_element(ids::SIMPLE_BLOCK, 1, &body).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_header_once_and_frames_after() {
        let buf = Vec::new();
        let writer = MkvWriter::new(
            buf,
            TrackConfig {
                video_codec_id: "V_VP8",
                colour_space: "I420",
                bit_depth: 8,
                audio: None,
            },
        );
        writer.write_video_frame(0, true, 640, 480, b"keyframe-payload").await.unwrap();
        writer.write_video_frame(33, false, 640, 480, b"delta-payload").await.unwrap();
        writer.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn new_cluster_on_keyframe() {
        let buf = Vec::new();
        let writer = MkvWriter::new(
            buf,
            TrackConfig {
                video_codec_id: "V_VP8",
                colour_space: "I420",
                bit_depth: 8,
                audio: None,
            },
        );
        writer.write_video_frame(0, true, 640, 480, b"kf1").await.unwrap();
        writer.write_video_frame(500, false, 640, 480, b"d1").await.unwrap();
        // Keyframe forces a new cluster even though < 1000ms since the last.
        writer.write_video_frame(600, true, 640, 480, b"kf2").await.unwrap();
        let guard = writer.inner.lock().await;
        assert_eq!(guard.cluster_start_ms, 600);
    }

    #[tokio::test]
    async fn cluster_rolls_over_after_max_duration() {
        let buf = Vec::new();
        let writer = MkvWriter::new(
            buf,
            TrackConfig {
                video_codec_id: "V_VP8",
                colour_space: "I420",
                bit_depth: 8,
                audio: None,
            },
        );
        writer.write_video_frame(0, true, 640, 480, b"kf").await.unwrap();
        writer.write_video_frame(1500, false, 640, 480, b"d").await.unwrap();
        let guard = writer.inner.lock().await;
        assert_eq!(guard.cluster_start_ms, 1500);
    }

    #[tokio::test]
    async fn first_frame_establishes_shared_base_timestamp() {
        let buf = Vec::new();
        let writer = MkvWriter::new(
            buf,
            TrackConfig {
                video_codec_id: "V_VP8",
                colour_space: "I420",
                bit_depth: 8,
                audio: Some(AudioConfig {
                    codec_id: "A_OPUS",
                    sample_rate: 48_000.0,
                    channels: 2,
                }),
            },
        );
        // Audio arrives first and anchors the shared base.
        writer.write_audio_frame(10_000, b"audio").await.unwrap();
        writer.write_video_frame(10_020, true, 640, 480, b"video-kf").await.unwrap();
        let guard = writer.inner.lock().await;
        assert_eq!(guard.base_ms, Some(10_000));
    }

    #[tokio::test]
    async fn headers_carry_decoded_resolution() {
        let buf = Vec::new();
        let writer = MkvWriter::new(
            buf,
            TrackConfig {
                video_codec_id: "V_UNCOMPRESSED",
                colour_space: "RGBA",
                bit_depth: 8,
                audio: None,
            },
        );
        writer.write_video_frame(0, true, 1280, 720, b"kf").await.unwrap();
        let guard = writer.inner.lock().await;
        assert_eq!(guard.video_dimensions, Some((1280, 720)));
    }

    #[test]
    fn simple_block_encodes_keyframe_flag() {
        let block = encode_simple_block(1, 0, true, b"x");
        // Last byte before payload carries the flags; payload is single byte.
        let flags_byte = block[block.len() - 2];
        assert_eq!(flags_byte, 0x80);
    }

    #[test]
    fn simple_block_rejects_nothing_but_range_is_caller_enforced() {
        let block = encode_simple_block(2, i16::MIN, false, b"y");
        assert!(!block.is_empty());
    }
}
