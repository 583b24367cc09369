//! PeerConnection facade (spec.md §4.14): media-engine codec registration
//! restricted to the negotiated set, transceiver direction, track
//! callbacks, and ICE state events.
//!
//! Structured like `beam-agent::peer`'s `WebRTCPeer` — a thin owned wrapper
//! around `RTCPeerConnection` with `on_*` callback setup methods — but
//! generalized from a fixed H.264/Opus sendonly browser peer to a
//! role-parameterized (WHEP recvonly / WHIP sendonly) VP8|VP9/Opus peer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9, MediaEngine};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use crate::config::VideoCodec;
use crate::error::{CoreError, SignalingError};

pub const PT_VP8: u8 = 97;
pub const PT_VP9: u8 = 98;
pub const PT_H264: u8 = 96;
pub const PT_OPUS: u8 = 111;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// WHEP: pull a remote stream, recvonly transceivers, on_track callback.
    Whep,
    /// WHIP: push a local stream, sendonly transceivers, owned RTP tracks.
    Whip,
}

pub struct PeerConnectionConfig {
    pub role: Role,
    pub video_codec: VideoCodec,
    pub audio_enabled: bool,
    pub stun_url: String,
}

/// Owns the transport. Implementations rely on the `webrtc` crate to
/// provide ICE/DTLS/SRTP (spec.md §1: "treated as an opaque PeerConnection
/// with the stated interface").
pub struct PeerConnectionFacade {
    inner: Arc<RTCPeerConnection>,
    video_track: Option<Arc<TrackLocalStaticRTP>>,
    audio_track: Option<Arc<TrackLocalStaticRTP>>,
    video_sender: Option<Arc<RTCRtpSender>>,
    audio_sender: Option<Arc<RTCRtpSender>>,
    ice_complete: Arc<Notify>,
}

impl PeerConnectionFacade {
    pub async fn new(config: PeerConnectionConfig) -> Result<Self, SignalingError> {
        let mut media_engine = MediaEngine::default();
        register_negotiated_codecs(&mut media_engine, &config)
            .map_err(|e| SignalingError::OfferCreation(format!("codec registration failed: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SignalingError::OfferCreation(format!("interceptor registration failed: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![config.stun_url.clone()],
                ..Default::default()
            }],
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| SignalingError::OfferCreation(format!("failed to create peer connection: {e}")))?,
        );

        let (video_track, audio_track, video_sender, audio_sender) = match config.role {
            Role::Whep => {
                peer_connection
                    .add_transceiver_from_kind(
                        RTPCodecType::Video,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await
                    .map_err(|e| SignalingError::OfferCreation(format!("video transceiver: {e}")))?;
                if config.audio_enabled {
                    peer_connection
                        .add_transceiver_from_kind(
                            RTPCodecType::Audio,
                            Some(RTCRtpTransceiverInit {
                                direction: RTCRtpTransceiverDirection::Recvonly,
                                send_encodings: vec![],
                            }),
                        )
                        .await
                        .map_err(|e| SignalingError::OfferCreation(format!("audio transceiver: {e}")))?;
                }
                (None, None, None, None)
            }
            Role::Whip => {
                let video_capability = video_codec_capability(config.video_codec);
                let video_track = Arc::new(TrackLocalStaticRTP::new(
                    video_capability,
                    "video".to_string(),
                    "rtcbridge".to_string(),
                ));
                let video_sender = peer_connection
                    .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| SignalingError::OfferCreation(format!("failed to add video track: {e}")))?;

                let (audio_track, audio_sender) = if config.audio_enabled {
                    let audio_track = Arc::new(TrackLocalStaticRTP::new(
                        RTCRtpCodecCapability {
                            mime_type: MIME_TYPE_OPUS.to_string(),
                            clock_rate: 48000,
                            channels: 2,
                            ..Default::default()
                        },
                        "audio".to_string(),
                        "rtcbridge".to_string(),
                    ));
                    let audio_sender = peer_connection
                        .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
                        .await
                        .map_err(|e| SignalingError::OfferCreation(format!("failed to add audio track: {e}")))?;
                    (Some(audio_track), Some(audio_sender))
                } else {
                    (None, None)
                };
                (Some(video_track), audio_track, Some(video_sender), audio_sender)
            }
        };

        let ice_complete = Arc::new(Notify::new());
        let ice_complete_cb = Arc::clone(&ice_complete);
        peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
            if state == RTCIceGathererState::Complete {
                ice_complete_cb.notify_one();
            }
            Box::pin(async {})
        }));

        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed => warn!("peer connection failed"),
                RTCPeerConnectionState::Disconnected => warn!("peer connection disconnected"),
                _ => info!(?state, "peer connection state changed"),
            }
            Box::pin(async {})
        }));

        Ok(Self {
            inner: peer_connection,
            video_track,
            audio_track,
            video_sender,
            audio_sender,
            ice_complete,
        })
    }

    pub fn video_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        self.video_track.clone()
    }

    pub fn audio_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        self.audio_track.clone()
    }

    /// Whether this connection has a local audio sender (WHIP role with
    /// `audio_enabled`). The RTCP watchdog needs this to know whether
    /// audio silence is meaningful or simply "no audio track negotiated".
    pub fn has_audio_sender(&self) -> bool {
        self.audio_sender.is_some()
    }

    /// Spawn RTCP readers on the local senders (WHIP role only), noting
    /// every received report on `clock` so the RTCP-silence watchdog
    /// (spec.md §4.11 worker 4) has a liveness signal. Mirrors
    /// `beam-agent::peer::WebRTCPeer::start_rtcp_reader`'s
    /// `while let Ok((packets, _)) = sender.read_rtcp().await` shape,
    /// generalized from PLI/FIR keyframe detection to a plain liveness tick.
    pub fn start_rtcp_readers(&self, on_video_report: impl Fn() + Send + Sync + 'static, on_audio_report: impl Fn() + Send + Sync + 'static) {
        if let Some(sender) = self.video_sender.clone() {
            tokio::spawn(async move {
                while let Ok((_packets, _attrs)) = sender.read_rtcp().await {
                    on_video_report();
                }
            });
        }
        if let Some(sender) = self.audio_sender.clone() {
            tokio::spawn(async move {
                while let Ok((_packets, _attrs)) = sender.read_rtcp().await {
                    on_audio_report();
                }
            });
        }
    }

    /// Register the callback invoked when a remote track arrives (WHEP
    /// role only). The callback receives the `TrackRemote` handle and its
    /// mime type.
    pub fn on_track(&self, callback: impl Fn(Arc<TrackRemote>, String) + Send + Sync + 'static) {
        let callback = Arc::new(callback);
        self.inner.on_track(Box::new(move |track, _receiver, _transceiver| {
            let mime_type = track.codec().capability.mime_type.to_lowercase();
            callback(track, mime_type);
            Box::pin(async {})
        }));
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.inner.connection_state()
    }

    /// Create the offer, set it as local, wait for ICE gathering to
    /// complete (bounded by `timeout`), and return the gathered SDP
    /// (spec.md §4.13 steps 4-5).
    pub async fn create_offer_and_gather(&self, timeout: Duration) -> Result<String, SignalingError> {
        let offer = self
            .inner
            .create_offer(None)
            .await
            .map_err(|e| SignalingError::OfferCreation(e.to_string()))?;

        self.inner
            .set_local_description(offer)
            .await
            .map_err(|e| SignalingError::OfferCreation(format!("set_local_description failed: {e}")))?;

        tokio::select! {
            _ = self.ice_complete.notified() => {
                debug!("ICE gathering complete");
            }
            _ = tokio::time::sleep(timeout) => {
                warn!("ICE gathering timed out, proceeding with candidates gathered so far");
            }
        }

        let local_desc = self
            .inner
            .local_description()
            .await
            .ok_or_else(|| SignalingError::IceGathering("no local description after gathering".to_string()))?;

        Ok(local_desc.sdp)
    }

    pub async fn set_remote_answer(&self, sdp: &str) -> Result<(), SignalingError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| SignalingError::RemoteDescription(format!("invalid answer SDP: {e}")))?;
        self.inner
            .set_remote_description(answer)
            .await
            .map_err(|e| SignalingError::RemoteDescription(e.to_string()))?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), CoreError> {
        self.inner
            .close()
            .await
            .map_err(|e| CoreError::Transport(format!("failed to close peer connection: {e}")))?;
        Ok(())
    }
}

fn register_negotiated_codecs(
    media_engine: &mut MediaEngine,
    config: &PeerConnectionConfig,
) -> Result<(), webrtc::Error> {
    let video_capability = video_codec_capability(config.video_codec);
    let payload_type = match config.video_codec {
        VideoCodec::Vp8 => PT_VP8,
        VideoCodec::Vp9 => PT_VP9,
    };
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: video_capability,
            payload_type,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    if config.audio_enabled {
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: PT_OPUS,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
    }

    // H.264 is recognized on ingress only (spec.md §1 non-goals); still
    // registered so a WHEP offer can name it and `on_track` can route it.
    if matches!(config.role, Role::Whep) {
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: PT_H264,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
    }

    Ok(())
}

fn video_codec_capability(codec: VideoCodec) -> RTCRtpCodecCapability {
    let mime_type = match codec {
        VideoCodec::Vp8 => MIME_TYPE_VP8,
        VideoCodec::Vp9 => MIME_TYPE_VP9,
    };
    RTCRtpCodecCapability {
        mime_type: mime_type.to_string(),
        clock_rate: 90000,
        ..Default::default()
    }
}
