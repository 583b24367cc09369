//! WHEP ingress pipeline (spec.md §4.12): per-track RTP reader →
//! depacketize → decode/validate → Matroska writer, with an adaptive
//! read timeout and a stream-timeout watchdog.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, warn};
use webrtc::track::track_remote::TrackRemote;

use crate::codec::opus::OpusDecoderFacade;
use crate::codec::vpx::{VpxDecoder, i420_to_rgba};
use crate::error::{CoreError, MediaError};
use crate::mkv::writer::MkvWriter;
use crate::rtp_io::VideoCodec;
use crate::rtp_io::depacketizer::{Vp8Depacketizer, Vp9Depacketizer, depacketize_opus};
use crate::timebase::TimestampUnwrapper;
use crate::validator::FrameValidator;

const INITIAL_READ_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT_GROWTH: Duration = Duration::from_secs(1);

/// Low-resolution preview suppression floor (spec.md §6): the writer
/// waits for the first keyframe at or above this resolution.
const LOW_RES_FLOOR: (u32, u32) = (640, 360);

/// Shared last-frame clock used by the stream-timeout watchdog.
#[derive(Default)]
pub struct StreamClock {
    last_frame_ms: AtomicI64,
}

impl StreamClock {
    pub fn note_frame(&self, now_ms: i64) {
        self.last_frame_ms.store(now_ms, Ordering::Relaxed);
    }
}

fn now_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

/// Read RTP packets from a video `TrackRemote`, depacketize per `codec`,
/// decode, validate, and write decoded RGBA frames to `writer`'s video
/// track.
pub async fn run_video_reader<W>(
    track: Arc<TrackRemote>,
    codec: VideoCodec,
    writer: Arc<MkvWriter<W>>,
    clock: Arc<StreamClock>,
    start: Instant,
    media_received: Arc<Notify>,
    read_timeout_ceiling: Duration,
) where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut unwrapper = TimestampUnwrapper::new();
    let mut decoder = match VpxDecoder::new(codec) {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "failed to open video decoder, aborting video reader");
            return;
        }
    };
    let mut validator = FrameValidator::new();
    let mut vp8 = Vp8Depacketizer::new();
    let mut vp9 = Vp9Depacketizer::new();
    let mut accepted_low_res = false;
    // spec.md §4.5: skip all frames until the first keyframe, so the decoder
    // is never fed a delta frame referencing a keyframe it never saw.
    let mut seen_keyframe = false;

    let mut timeout = INITIAL_READ_TIMEOUT;
    let mut notified_media = false;
    let mut frame_count = 0u64;

    loop {
        let read = tokio::time::timeout(timeout, track.read_rtp()).await;
        let (packet, _attrs) = match read {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                debug!(error = %e, "video track read_rtp ended");
                return;
            }
            Err(_) => {
                timeout = (timeout + READ_TIMEOUT_GROWTH).min(read_timeout_ceiling);
                continue;
            }
        };
        timeout = INITIAL_READ_TIMEOUT;

        if !notified_media {
            media_received.notify_one();
            notified_media = true;
        }

        let depacketized = match codec {
            VideoCodec::Vp8 => vp8.push(&packet.payload, packet.header.marker),
            VideoCodec::Vp9 => vp9.push(&packet.payload, packet.header.marker),
        };
        let frame = match depacketized {
            Ok(Some(f)) => f,
            Ok(None) => continue,
            Err(e) => {
                debug!(error = %e, "video depacketize error, dropping packet");
                continue;
            }
        };

        if !seen_keyframe {
            if !frame.is_keyframe {
                continue;
            }
            seen_keyframe = true;
        }

        let extended_ts = unwrapper.unwrap_timestamp(packet.header.timestamp);
        let ts_ms = crate::timebase::extended_ts_to_ms(extended_ts, 90_000) as i64;

        let decoded = match decoder.decode(&frame.payload) {
            Ok(frames) => frames,
            Err(e) => {
                debug!(error = %e, "video decode error, holding last good frame");
                continue;
            }
        };

        for i420 in decoded {
            if !accepted_low_res
                && ((i420.width as u32) < LOW_RES_FLOOR.0 || (i420.height as u32) < LOW_RES_FLOOR.1)
            {
                continue;
            }
            accepted_low_res = true;

            let rgba = i420_to_rgba(&i420);
            if frame.is_keyframe {
                validator.note_keyframe_arrived();
            }
            let (emit, outcome) = validator.validate_frame(&rgba, frame.is_keyframe);
            if outcome.needs_keyframe {
                debug!("validator requesting keyframe after consecutive invalid frames");
            }

            let Some(emit) = emit else {
                debug!("no good frame to emit yet, suppressing invalid frame");
                continue;
            };

            if let Err(e) = writer
                .write_video_frame(ts_ms, frame.is_keyframe, i420.width as u32, i420.height as u32, &emit.data)
                .await
            {
                warn!(error = %e, "failed to write video frame");
            }
            frame_count += 1;
            if frame_count.is_multiple_of(300) {
                debug!(frame_count, "decoded video frames");
            }
            clock.note_frame(now_ms(start));
        }
    }
}

/// Read RTP packets from an audio `TrackRemote` (Opus passthrough into the
/// Matroska writer; decode is only needed if a future remote path hands us
/// PCM instead).
pub async fn run_audio_reader<W>(
    track: Arc<TrackRemote>,
    writer: Arc<MkvWriter<W>>,
    clock: Arc<StreamClock>,
    start: Instant,
    media_received: Arc<Notify>,
    read_timeout_ceiling: Duration,
) where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut unwrapper = TimestampUnwrapper::new();
    let mut timeout = INITIAL_READ_TIMEOUT;
    let mut notified_media = false;

    loop {
        let read = tokio::time::timeout(timeout, track.read_rtp()).await;
        let (packet, _attrs) = match read {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                debug!(error = %e, "audio track read_rtp ended");
                return;
            }
            Err(_) => {
                timeout = (timeout + READ_TIMEOUT_GROWTH).min(read_timeout_ceiling);
                continue;
            }
        };
        timeout = INITIAL_READ_TIMEOUT;

        if !notified_media {
            media_received.notify_one();
            notified_media = true;
        }

        let frame = depacketize_opus(&packet.payload);
        let extended_ts = unwrapper.unwrap_timestamp(packet.header.timestamp);
        let ts_ms = crate::timebase::extended_ts_to_ms(extended_ts, 48_000) as i64;

        if let Err(e) = writer.write_audio_frame(ts_ms, &frame.payload).await {
            warn!(error = %e, "failed to write audio frame");
        }
        clock.note_frame(now_ms(start));
    }
}

/// Also offered for a remote path that hands us decoded PCM rather than
/// Opus packets; kept separate from the passthrough reader above since it
/// owns an `OpusDecoderFacade` the passthrough path never needs.
pub struct PcmAudioPath {
    decoder: OpusDecoderFacade,
}

impl PcmAudioPath {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, MediaError> {
        Ok(Self {
            decoder: OpusDecoderFacade::new(sample_rate, channels)?,
        })
    }

    pub fn decode(&mut self, opus_packet: &[u8]) -> Result<Vec<i16>, MediaError> {
        self.decoder.decode(opus_packet)
    }
}

/// Stream-timeout watchdog: if no frame on any track for `stream_timeout`,
/// abort (spec.md §4.12).
pub async fn run_stream_watchdog(clock: Arc<StreamClock>, start: Instant, stream_timeout: Duration) -> Result<(), CoreError> {
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let silence = now_ms(start) - clock.last_frame_ms.load(Ordering::Relaxed);
        if silence > stream_timeout.as_millis() as i64 {
            return Err(CoreError::Transport(format!(
                "inter-frame stream timeout: no frame for {silence}ms"
            )));
        }
    }
}

/// Await the `media_received` one-shot signal, or the driver's own
/// timeout, whichever fires first. Returns `true` if media arrived.
pub async fn await_media_received(notify: Arc<Notify>, timeout: Duration) -> bool {
    tokio::select! {
        _ = notify.notified() => true,
        _ = tokio::time::sleep(timeout) => false,
    }
}
