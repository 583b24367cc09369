//! WHEP ingress client entry point (spec.md §4.12, §6): negotiates a single
//! WHEP session, reads the negotiated tracks, and writes a Matroska stream
//! to stdout until the peer goes silent or the process is signaled.
//!
//! Driver shape follows `beam-agent::main`'s `tokio::select!` wiring of
//! `ctrl_c()`/`sigterm.recv()` around the worker set, generalized from the
//! teacher's always-on capture/encode loop to a reconnect-bounded session
//! loop (spec.md §6: a fixed number of attempts, not forever).

mod cli;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rtcbridge_core::config::{Config, VideoCodec};
use rtcbridge_core::mkv::writer::{AudioConfig, MkvWriter, TrackConfig};
use rtcbridge_core::peer::{PeerConnectionConfig, PeerConnectionFacade, Role};
use rtcbridge_core::pipeline::ingress::{
    StreamClock, await_media_received, run_audio_reader, run_stream_watchdog, run_video_reader,
};
use rtcbridge_core::rtp_io::VideoCodec as RtpVideoCodec;
use rtcbridge_core::signaling;

/// Ceiling the adaptive RTP read timeout grows to (spec.md §4.12,
/// §5 "Initial RTP read: 2s, grows by 1s, capped"). Not exposed as a config
/// field — only the starting value and the stream-silence timeout are.
const READ_TIMEOUT_CEILING: Duration = Duration::from_secs(10);

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
        audio = config.audio.enabled,
        "starting rtcbridge-whep"
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = tokio::select! {
            result = run_session(&config) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                return Ok(());
            }
        };

        match outcome {
            Ok(()) => {
                info!("session ended cleanly");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, attempt, "whep session failed");
                if attempt >= config.timeouts.reconnect_attempts {
                    error!(attempt, "exhausted reconnect attempts, giving up");
                    return Err(e);
                }
                tokio::time::sleep(Duration::from_secs(config.timeouts.reconnect_interval_secs)).await;
            }
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
    config.audio.enabled = args.audio_enabled;
    config.video.low_res_floor = args.low_res_floor;
    if let Some(secs) = args.stream_timeout_secs {
        config.timeouts.stream_timeout_secs = secs;
    }
    if let Some(n) = args.reconnect_attempts {
        config.timeouts.reconnect_attempts = n;
    }

    Ok(config)
}

/// Run one WHEP session end-to-end: negotiate, pull media into an MKV
/// stream on stdout, and return once the stream-timeout watchdog fires or
/// the remote end closes both tracks.
async fn run_session(config: &Config) -> anyhow::Result<()> {
    let peer = PeerConnectionFacade::new(PeerConnectionConfig {
        role: Role::Whep,
        video_codec: config.video.codec,
        audio_enabled: config.audio.enabled,
        stun_url: config.signaling.stun_url.clone(),
    })
    .await
    .context("failed to build peer connection")?;

    let writer = Arc::new(MkvWriter::new(
        tokio::io::stdout(),
        TrackConfig {
            video_codec_id: "V_UNCOMPRESSED",
            colour_space: "RGBA",
            bit_depth: 8,
            audio: config.audio.enabled.then(|| AudioConfig {
                codec_id: "A_OPUS",
                sample_rate: config.audio.sample_rate as f64,
                channels: config.audio.channels,
            }),
        },
    ));

    let clock = Arc::new(StreamClock::default());
    let media_received = Arc::new(Notify::new());
    let start = Instant::now();
    let rtp_codec = match config.video.codec {
        VideoCodec::Vp8 => RtpVideoCodec::Vp8,
        VideoCodec::Vp9 => RtpVideoCodec::Vp9,
    };
    let handles: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let writer = Arc::clone(&writer);
        let clock = Arc::clone(&clock);
        let media_received = Arc::clone(&media_received);
        let handles = Arc::clone(&handles);
        peer.on_track(move |track, mime_type| {
            let writer = Arc::clone(&writer);
            let clock = Arc::clone(&clock);
            let media_received = Arc::clone(&media_received);
            info!(mime_type = %mime_type, "remote track arrived");
            let handle = if mime_type.contains("vp8") || mime_type.contains("vp9") {
                tokio::spawn(run_video_reader(
                    track,
                    rtp_codec,
                    writer,
                    clock,
                    start,
                    media_received,
                    READ_TIMEOUT_CEILING,
                ))
            } else if mime_type.contains("opus") {
                tokio::spawn(run_audio_reader(
                    track,
                    writer,
                    clock,
                    start,
                    media_received,
                    READ_TIMEOUT_CEILING,
                ))
            } else {
                debug!(mime_type = %mime_type, "ignoring track with unrecognized codec");
                return;
            };
            handles.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
        });
    }

    signaling::exchange(
        &peer,
        &config.signaling.url,
        Duration::from_secs(config.signaling.http_timeout_secs),
        Duration::from_secs(config.signaling.ice_gather_timeout_secs),
    )
    .await
    .context("WHEP signaling exchange failed")?;

    let startup_window = Duration::from_secs(config.timeouts.initial_rtp_read_secs * 5);
    if !await_media_received(Arc::clone(&media_received), startup_window).await {
        let _ = peer.close().await;
        anyhow::bail!("no media received within {startup_window:?} of signaling completing");
    }

    let watchdog = run_stream_watchdog(
        Arc::clone(&clock),
        start,
        Duration::from_secs(config.timeouts.stream_timeout_secs),
    )
    .await;

    for handle in handles.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
        handle.abort();
    }
    let _ = peer.close().await;
    writer.finalize().await.context("failed to flush mkv writer")?;

    watchdog.context("stream watchdog")
}
