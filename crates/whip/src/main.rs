//! WHIP egress client entry point (spec.md §4.11, §6): reads one Matroska
//! stream from stdin, encodes and packetizes it, and pushes it to a remote
//! WHIP endpoint until the input closes, the RTCP watchdog trips, or the
//! process is signaled.
//!
//! Worker wiring follows `beam-agent::main`'s `tokio::select!` around the
//! capture/encode/send/signaling tasks, generalized from a fixed capture
//! thread + two send loops to a reader task, an ingester, two per-track
//! senders, and an RTCP watchdog, all fed by `rtcbridge-core`'s pipeline
//! module. Unlike WHEP, there is no reconnect loop here — stdin is a
//! single, non-replayable stream, so a failed session simply exits.

mod cli;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use anyhow::Context;
use rand::Rng;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use rtcbridge_core::codec::opus::OpusEncoderFacade;
use rtcbridge_core::codec::vp8_encoder::{Vp8Encoder, Vp8EncoderConfig};
use rtcbridge_core::config::Config;
use rtcbridge_core::error::ContainerError;
use rtcbridge_core::mkv::reader::MkvReader;
use rtcbridge_core::mkv::{Frame, TrackEntry, TrackKind};
use rtcbridge_core::peer::{PeerConnectionConfig, PeerConnectionFacade, Role};
use rtcbridge_core::pipeline::EgressQueue;
use rtcbridge_core::pipeline::egress::{RtcpClock, run_audio_sender, run_ingester, run_rtcp_watchdog, run_video_sender};
use rtcbridge_core::signaling;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::parse_args()?;
    let config = build_config(&args)?;

    if let Err(issues) = config.validate() {
        for issue in &issues {
            eprintln!("{issue}");
        }
        anyhow::bail!("invalid configuration ({} issue(s))", issues.len());
    }

    info!(
        url = %config.signaling.url,
        codec = ?config.video.codec,
        "starting rtcbridge-whip"
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = run_session(&config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            Ok(())
        }
    }
}

fn build_config(args: &cli::Args) -> anyhow::Result<Config> {
    let mut config = match &args.config_path {
        Some(path) => Config::load(std::path::Path::new(path))?,
        None => Config::default(),
    };

    if !args.url.is_empty() {
        config.signaling.url = args.url.clone();
    }
    config.video.codec = args.video_codec;
    if let Some(bitrate) = args.bitrate_bps {
        config.video.bitrate_bps = bitrate;
    }
    if let Some(distance) = args.max_keyframe_distance {
        config.video.max_keyframe_distance = distance;
    }

    Ok(config)
}

fn find_track(tracks: &[TrackEntry], kind: TrackKind) -> Option<TrackEntry> {
    tracks.iter().find(|t| t.kind == kind).cloned()
}

async fn run_session(config: &Config) -> anyhow::Result<()> {
    let mut reader = MkvReader::new(tokio::io::stdin());
    reader
        .read_headers()
        .await
        .context("failed to read mkv headers from stdin")?;

    let video_entry = find_track(reader.tracks(), TrackKind::Video)
        .context("no video track in input stream")?;
    let video_info = video_entry
        .video
        .clone()
        .context("video track is missing VideoTrackInfo fields")?;
    if video_entry.codec_id != "V_UNCOMPRESSED" || video_info.colour_space != "RGBA" {
        anyhow::bail!(
            "unsupported input video track: codec_id={} colour_space={} (expected V_UNCOMPRESSED/RGBA)",
            video_entry.codec_id,
            video_info.colour_space
        );
    }

    let audio_entry = find_track(reader.tracks(), TrackKind::Audio);
    let audio_enabled = audio_entry.is_some();

    info!(
        width = video_info.pixel_width,
        height = video_info.pixel_height,
        audio = audio_enabled,
        "negotiated input track layout"
    );

    let peer = PeerConnectionFacade::new(PeerConnectionConfig {
        role: Role::Whip,
        video_codec: config.video.codec,
        audio_enabled,
        stun_url: config.signaling.stun_url.clone(),
    })
    .await
    .context("failed to build peer connection")?;

    signaling::exchange(
        &peer,
        &config.signaling.url,
        Duration::from_secs(config.signaling.http_timeout_secs),
        Duration::from_secs(config.signaling.ice_gather_timeout_secs),
    )
    .await
    .context("WHIP signaling exchange failed")?;

    let video_encoder = Vp8Encoder::new(Vp8EncoderConfig {
        width: video_info.pixel_width,
        height: video_info.pixel_height,
        bitrate_bps: config.video.bitrate_bps,
        max_keyframe_distance: config.video.max_keyframe_distance,
        min_quantizer: config.video.min_quantizer,
        max_quantizer: config.video.max_quantizer,
    })
    .context("failed to open VP8 encoder")?;

    let audio_encoder = match audio_entry.as_ref().and_then(|t| t.audio.clone()) {
        Some(info) => Some(
            OpusEncoderFacade::new(info.sample_rate as u32, info.channels)
                .context("failed to open Opus encoder")?,
        ),
        None => None,
    };

    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(config.pipeline.queue_capacity);
    let video_queue = Arc::new(Mutex::new(EgressQueue::new(
        config.pipeline.queue_capacity,
        config.pipeline.trim_depth_threshold,
    )));
    let audio_queue = Arc::new(Mutex::new(EgressQueue::new(
        config.pipeline.queue_capacity,
        config.pipeline.trim_depth_threshold,
    )));
    let video_resync_pending = Arc::new(AtomicBool::new(false));
    let audio_resync_pending = Arc::new(AtomicBool::new(false));
    let rtcp_clock = Arc::new(RtcpClock::default());
    let start = Instant::now();

    {
        let rtcp_clock_video = Arc::clone(&rtcp_clock);
        let rtcp_clock_audio = Arc::clone(&rtcp_clock);
        peer.start_rtcp_readers(
            move || rtcp_clock_video.note_video_report(start.elapsed().as_millis() as i64),
            move || rtcp_clock_audio.note_audio_report(start.elapsed().as_millis() as i64),
        );
    }

    let video_track = peer
        .video_track()
        .context("peer connection has no local video track (WHIP role must add one)")?;
    let audio_track = peer.audio_track();

    let mut rng = rand::thread_rng();
    let ssrc_video: u32 = rng.gen();
    let ssrc_audio: u32 = rng.gen();
    drop(rng);

    let reader_task = tokio::spawn(async move {
        loop {
            match reader.read_frames_into(&frame_tx).await {
                Ok(true) => continue,
                Ok(false) => {
                    info!("input stream closed");
                    return Ok::<(), ContainerError>(());
                }
                Err(e) => {
                    warn!(error = %e, "mkv reader error, stopping ingestion");
                    return Err(e);
                }
            }
        }
    });

    tokio::spawn(run_ingester(
        frame_rx,
        Arc::clone(&video_queue),
        Arc::clone(&audio_queue),
        Arc::clone(&video_resync_pending),
        Arc::clone(&audio_resync_pending),
        video_encoder,
        audio_encoder,
    ));

    {
        let video_queue = Arc::clone(&video_queue);
        let video_resync_pending = Arc::clone(&video_resync_pending);
        let config = config.clone();
        tokio::spawn(async move {
            run_video_sender(video_queue, video_resync_pending, video_track, &config, ssrc_video).await
        });
    }

    if let Some(audio_track) = audio_track {
        let audio_queue = Arc::clone(&audio_queue);
        let audio_resync_pending = Arc::clone(&audio_resync_pending);
        let config = config.clone();
        tokio::spawn(async move {
            run_audio_sender(audio_queue, audio_resync_pending, audio_track, &config, ssrc_audio).await
        });
    }

    let watchdog_timeout = Duration::from_secs(config.timeouts.rtcp_timeout_secs);
    let result = tokio::select! {
        r = run_rtcp_watchdog(Arc::clone(&rtcp_clock), start, watchdog_timeout, peer.has_audio_sender()) => r.context("RTCP watchdog"),
        r = reader_task => match r {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e).context("mkv reader failed"),
            Err(e) => Err(e).context("reader task panicked"),
        },
    };

    let _ = peer.close().await;
    result
}
