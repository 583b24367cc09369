//! Minimal EBML/Matroska reader and writer: just enough frame-accurate
//! container I/O for a two-track (one video, one optional audio) stream.

pub mod ids;
pub mod reader;
pub mod writer;

use bytes::Bytes;

/// Which track a [`Frame`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// A demuxed (or about-to-be-muxed) container frame.
///
/// Lifetime: created by the MKV reader or a decoder, owned by a single
/// pipeline stage, destroyed after mux or encode (spec.md §3).
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: TrackKind,
    pub payload: Bytes,
    /// Absolute timestamp in milliseconds (cluster + relative).
    pub timestamp_ms: i64,
    pub is_keyframe: bool,
    /// Cluster timecode this frame was read from, preserved so
    /// rate-derived audio PTS (Opus lacing) can be recomputed if needed.
    pub cluster_time_ms: i64,
    pub block_relative_ms: i32,
}

/// Codec-specific fields for a video track.
#[derive(Debug, Clone, Default)]
pub struct VideoTrackInfo {
    pub pixel_width: u32,
    pub pixel_height: u32,
    /// FourCC from the `ColourSpace` element, e.g. "RGBA" or "I420"/"YUV420P".
    pub colour_space: String,
    pub bit_depth: u8,
}

/// Codec-specific fields for an audio track.
#[derive(Debug, Clone, Default)]
pub struct AudioTrackInfo {
    pub sample_rate: f64,
    pub channels: u16,
    pub bit_depth: u8,
}

/// A parsed `TrackEntry`. Created when the MKV `Tracks` element closes.
#[derive(Debug, Clone)]
pub struct TrackEntry {
    pub track_number: u64,
    pub kind: TrackKind,
    pub codec_id: String,
    pub video: Option<VideoTrackInfo>,
    pub audio: Option<AudioTrackInfo>,
}
