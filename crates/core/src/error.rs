//! The six-kind error taxonomy from the design doc's error-handling section.
//!
//! Each module boundary returns one of these variant families so callers can
//! match on *kind* (fail-fast vs. retry vs. drop-and-continue) without
//! string-matching `Display` output. `main()` in each binary still collapses
//! everything into `anyhow::Result` via `?`.

use thiserror::Error;

/// Top-level taxonomy. Mirrors `FrameError` in shape: one variant per
/// component family, each carrying enough context to reconstruct a useful
/// message without re-deriving it from a wrapped error.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    #[error("resource error: {0}")]
    Resource(String),
}

/// Signaling-specific errors (spec.md §4.13, §7.2). Media errors never flow
/// through this type — they are handled in-place by the pipeline.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("offer creation failed: {0}")]
    OfferCreation(String),

    #[error("ICE gathering did not complete: {0}")]
    IceGathering(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("signaling endpoint returned {status}: {body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("failed to apply remote description: {0}")]
    RemoteDescription(String),
}

/// Container (EBML/Matroska) errors. Fatal to the current pipeline per
/// spec.md §7.5 — no silent skipping of malformed elements.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error(transparent)]
    Ebml(#[from] EbmlError),

    #[error("truncated block: expected {expected} bytes, got {actual}")]
    TruncatedBlock { expected: usize, actual: usize },

    #[error("element size mismatch: {0}")]
    SizeMismatch(String),

    #[error("no video track found in input")]
    NoVideoTrack,

    #[error("unsupported codec id: {0}")]
    UnsupportedCodec(String),

    #[error("emission channel send timed out after {0:?}")]
    SendTimeout(std::time::Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// EBML vint/element framing errors (spec.md §4.1). A malformed vint aborts
/// the current element; there is no recovery within a single parse call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EbmlError {
    #[error("empty vint")]
    EmptyVint,

    #[error("vint length prefix byte 0x{0:02x} has no set bits")]
    InvalidLengthDescriptor(u8),

    #[error("vint truncated: need {need} bytes, have {have}")]
    TruncatedVint { need: usize, have: usize },

    #[error("element ID first byte must not be 0x00")]
    InvalidIdFirstByte,

    #[error("element ID longer than 4 bytes")]
    IdTooLong,

    #[error("unexpected end of buffer")]
    UnexpectedEof,
}

/// Media-plane errors (decode/encode/depacketize failures). These are
/// recoverable by design: the frame is dropped or replaced and a counter is
/// incremented, never funneled through the bounded error channel.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("depacketize error: {0}")]
    Depacketize(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),
}
