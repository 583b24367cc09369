//! Shared media-plane core for the WHEP/WHIP bridge.
//!
//! This crate owns everything between the transport (an opaque
//! [`peer::PeerConnectionFacade`]) and container I/O: EBML/Matroska encode and
//! decode, RTP depacketization/packetization for VP8/VP9/Opus, the VPX codec
//! glue, per-track time-base reconciliation, the frame-quality validator, the
//! wall-clock pacer, and the two concurrent pipeline variants (WHIP egress,
//! WHEP ingress).

pub mod codec;
pub mod config;
pub mod ebml;
pub mod error;
pub mod mkv;
pub mod pacer;
pub mod peer;
pub mod pipeline;
pub mod rtp_io;
pub mod signaling;
pub mod timebase;
pub mod validator;

pub use config::Config;
pub use error::CoreError;
