//! WHIP egress pipeline (spec.md §4.11): MKV stdin → encode → packetize →
//! RTP track, with bounded queues, pacing, and an RTCP-silence watchdog.
//!
//! The per-worker counters and periodic health logging follow
//! `beam-agent::video::run_video_send_loop`'s shape, generalized from a
//! single H.264 sendonly loop into a pair of workers (video/audio) fed by
//! bounded `EgressQueue`s instead of a raw `mpsc::Receiver`. The
//! eviction-triggers-pacer-resync rule (spec.md §4.11) is carried across
//! tasks with a plain `Arc<AtomicBool>` flag, the same shape as the
//! teacher's `force_keyframe: Arc<AtomicBool>`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::codec::opus::OpusEncoderFacade;
use crate::codec::vp8_encoder::Vp8Encoder;
use crate::config::Config;
use crate::error::CoreError;
use crate::mkv::{Frame, TrackKind};
use crate::pacer::Pacer;
use crate::pipeline::EgressQueue;
use crate::rtp_io::packetizer::{OPUS_PAYLOAD_TYPE, RtpPacketizer, VP8_PAYLOAD_TYPE};

type VideoItem = (i64, bool, Vec<u8>);
type AudioItem = (i64, Vec<u8>);

/// Shared "last RTCP report" clock; the watchdog aborts the session if
/// either sender's last report is older than `rtcp_timeout`.
#[derive(Default)]
pub struct RtcpClock {
    video_last_report_ms: AtomicI64,
    audio_last_report_ms: AtomicI64,
}

impl RtcpClock {
    pub fn note_video_report(&self, now_ms: i64) {
        self.video_last_report_ms.store(now_ms, Ordering::Relaxed);
    }
    pub fn note_audio_report(&self, now_ms: i64) {
        self.audio_last_report_ms.store(now_ms, Ordering::Relaxed);
    }
}

fn now_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

/// Ingester: reads MKV frames, encodes video to VP8 and PCM to Opus, and
/// enqueues onto the per-track queues (spec.md §4.11 worker 1).
pub async fn run_ingester(
    mut frame_rx: tokio::sync::mpsc::Receiver<Frame>,
    video_queue: Arc<Mutex<EgressQueue<VideoItem>>>,
    audio_queue: Arc<Mutex<EgressQueue<AudioItem>>>,
    video_resync_pending: Arc<AtomicBool>,
    audio_resync_pending: Arc<AtomicBool>,
    mut video_encoder: Vp8Encoder,
    mut audio_encoder: Option<OpusEncoderFacade>,
) {
    let mut video_frames = 0u64;
    let mut audio_frames = 0u64;

    while let Some(frame) = frame_rx.recv().await {
        match frame.kind {
            TrackKind::Video => {
                let encoded = match video_encoder.encode(&frame.payload, frame.timestamp_ms) {
                    Ok(packets) => packets,
                    Err(e) => {
                        warn!(error = %e, "video encode failed, dropping frame");
                        continue;
                    }
                };
                for packet in encoded {
                    let mut q = video_queue.lock().await;
                    if q.push((frame.timestamp_ms, packet.is_keyframe, packet.data))
                        .is_some()
                    {
                        video_resync_pending.store(true, Ordering::Relaxed);
                    }
                }
                video_frames += 1;
                if video_frames.is_multiple_of(300) {
                    debug!(video_frames, "ingested video frames");
                }
            }
            TrackKind::Audio => {
                let Some(encoder) = audio_encoder.as_mut() else {
                    continue;
                };
                let samples: Vec<i16> = frame
                    .payload
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect();
                let encoded = match encoder.encode(&samples) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "audio encode failed, dropping frame");
                        continue;
                    }
                };
                let mut q = audio_queue.lock().await;
                if q.push((frame.timestamp_ms, encoded)).is_some() {
                    audio_resync_pending.store(true, Ordering::Relaxed);
                }
                audio_frames += 1;
            }
        }
    }
    info!(video_frames, audio_frames, "ingester: input stream closed");
}

/// Sender worker for the video track: dequeue, pace, packetize, write.
pub async fn run_video_sender(
    video_queue: Arc<Mutex<EgressQueue<VideoItem>>>,
    video_resync_pending: Arc<AtomicBool>,
    track: Arc<TrackLocalStaticRTP>,
    config: &Config,
    ssrc: u32,
) {
    let mut pacer = Pacer::new(Duration::from_millis(config.pipeline.pacer_max_wait_ms));
    let mut packetizer = RtpPacketizer::new(VP8_PAYLOAD_TYPE, ssrc);
    let drop_threshold = Duration::from_millis(0);

    loop {
        let item = {
            let mut q = video_queue.lock().await;
            q.pop_front()
        };
        let Some((pts_ms, is_keyframe, data)) = item else {
            tokio::time::sleep(Duration::from_millis(5)).await;
            continue;
        };

        if video_resync_pending.swap(false, Ordering::Relaxed) {
            pacer.resync(pts_ms);
        }

        pacer.wait(pts_ms).await;
        if !is_keyframe && pacer.should_drop(pts_ms, drop_threshold) {
            continue;
        }

        for packet in packetizer.packetize_vp8(&data, pts_ms) {
            if let Err(e) = track.write_rtp(&packet).await {
                warn!(error = %e, "video write_rtp failed");
            }
        }
    }
}

/// Sender worker for the audio track, mirroring the video sender without
/// the late-frame drop (audio underruns are worse than audio lateness).
pub async fn run_audio_sender(
    audio_queue: Arc<Mutex<EgressQueue<AudioItem>>>,
    audio_resync_pending: Arc<AtomicBool>,
    track: Arc<TrackLocalStaticRTP>,
    config: &Config,
    ssrc: u32,
) {
    let mut pacer = Pacer::new(Duration::from_millis(config.pipeline.pacer_max_wait_ms));
    let mut packetizer = RtpPacketizer::new(OPUS_PAYLOAD_TYPE, ssrc);

    loop {
        let item = {
            let mut q = audio_queue.lock().await;
            q.pop_front()
        };
        let Some((pts_ms, data)) = item else {
            tokio::time::sleep(Duration::from_millis(5)).await;
            continue;
        };

        if audio_resync_pending.swap(false, Ordering::Relaxed) {
            pacer.resync(pts_ms);
        }

        pacer.wait(pts_ms).await;
        let packet = packetizer.packetize_opus(&data, pts_ms);
        if let Err(e) = track.write_rtp(&packet).await {
            warn!(error = %e, "audio write_rtp failed");
        }
    }
}

/// Watchdog: every second, check the active RTCP clock(s) against
/// `rtcp_timeout`; abort the session if any active track has been silent
/// too long (spec.md §4.11 worker 4). `has_audio` must reflect whether an
/// audio sender actually exists (video-only WHIP sessions never produce
/// audio RTCP, so folding an always-stale `audio_last_report_ms` into the
/// check would trip the watchdog a few seconds into every audio-less run).
pub async fn run_rtcp_watchdog(
    clock: Arc<RtcpClock>,
    start: Instant,
    rtcp_timeout: Duration,
    has_audio: bool,
) -> Result<(), CoreError> {
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let now = now_ms(start);
        let video_silence = now - clock.video_last_report_ms.load(Ordering::Relaxed);
        let max_silence = if has_audio {
            let audio_silence = now - clock.audio_last_report_ms.load(Ordering::Relaxed);
            video_silence.max(audio_silence)
        } else {
            video_silence
        };
        if max_silence > rtcp_timeout.as_millis() as i64 {
            return Err(CoreError::Transport(format!(
                "RTCP timeout: no report for {max_silence}ms"
            )));
        }
    }
}
