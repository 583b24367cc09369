//! Shared configuration struct, generalizing `beam-protocol::config::BeamConfig`.
//!
//! Loaded from an optional TOML file via the `toml` crate and merged over
//! built-in defaults; CLI flags in each binary's `cli.rs` override
//! config-file values after the fact (`Config::merge_cli`-style call sites
//! live in the binaries, not here).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            video: VideoConfig::default(),
            audio: AudioConfig::default(),
            pipeline: PipelineConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WHEP/WHIP endpoint URL. Empty until filled in by a CLI flag.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_ice_gather_timeout_secs")]
    pub ice_gather_timeout_secs: u64,
    #[serde(default = "default_stun_url")]
    pub stun_url: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            http_timeout_secs: default_http_timeout_secs(),
            ice_gather_timeout_secs: default_ice_gather_timeout_secs(),
            stun_url: default_stun_url(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Vp8,
    Vp9,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_video_codec")]
    pub codec: VideoCodec,
    #[serde(default = "default_bitrate_bps")]
    pub bitrate_bps: u32,
    #[serde(default = "default_max_keyframe_distance")]
    pub max_keyframe_distance: u32,
    #[serde(default = "default_min_quantizer")]
    pub min_quantizer: u32,
    #[serde(default = "default_max_quantizer")]
    pub max_quantizer: u32,
    #[serde(default = "default_low_res_floor")]
    pub low_res_floor: (u32, u32),
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            codec: default_video_codec(),
            bitrate_bps: default_bitrate_bps(),
            max_keyframe_distance: default_max_keyframe_distance(),
            min_quantizer: default_min_quantizer(),
            max_quantizer: default_max_quantizer(),
            low_res_floor: default_low_res_floor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: default_sample_rate(),
            channels: default_channels(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_trim_depth_threshold")]
    pub trim_depth_threshold: usize,
    #[serde(default = "default_pacer_max_wait_ms")]
    pub pacer_max_wait_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            trim_depth_threshold: default_trim_depth_threshold(),
            pacer_max_wait_ms: default_pacer_max_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_rtcp_timeout_secs")]
    pub rtcp_timeout_secs: u64,
    #[serde(default = "default_initial_rtp_read_secs")]
    pub initial_rtp_read_secs: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            stream_timeout_secs: default_stream_timeout_secs(),
            rtcp_timeout_secs: default_rtcp_timeout_secs(),
            initial_rtp_read_secs: default_initial_rtp_read_secs(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
        }
    }
}

impl Config {
    /// Validate the configuration, returning every issue found rather than
    /// failing on the first. Invalid sample rate / unsupported codec choice
    /// is a Configuration error (spec.md §7.1) and must fail fast, before any
    /// network I/O — callers should treat a non-empty result as fatal.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.signaling.url.is_empty() {
            issues.push("ERROR: signaling.url must be set".to_string());
        } else if !self.signaling.url.starts_with("http://")
            && !self.signaling.url.starts_with("https://")
        {
            issues.push(format!(
                "ERROR: signaling.url '{}' must start with http:// or https://",
                self.signaling.url
            ));
        }

        if !matches!(
            self.audio.sample_rate,
            8000 | 12000 | 16000 | 24000 | 48000
        ) {
            issues.push(format!(
                "ERROR: audio.sample_rate {} is not a valid Opus rate (8000, 12000, 16000, 24000, 48000)",
                self.audio.sample_rate
            ));
        }

        if !matches!(self.audio.channels, 1 | 2) {
            issues.push(format!(
                "ERROR: audio.channels must be 1 or 2, got {}",
                self.audio.channels
            ));
        }

        if self.video.min_quantizer > self.video.max_quantizer {
            issues.push(format!(
                "ERROR: video.min_quantizer ({}) must be <= video.max_quantizer ({})",
                self.video.min_quantizer, self.video.max_quantizer
            ));
        }

        if self.pipeline.queue_capacity == 0 {
            issues.push("ERROR: pipeline.queue_capacity must be >= 1".to_string());
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }

    /// Load a TOML overlay from `path` and merge it over defaults. A missing
    /// file is not an error — the caller only passes `Some(path)` when
    /// `--config` was given explicitly.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
        Ok(config)
    }
}

fn default_http_timeout_secs() -> u64 {
    30
}
fn default_ice_gather_timeout_secs() -> u64 {
    10
}
fn default_stun_url() -> String {
    "stun:stun.l.google.com:19302".to_string()
}
fn default_video_codec() -> VideoCodec {
    VideoCodec::Vp8
}
fn default_bitrate_bps() -> u32 {
    5_000_000
}
fn default_max_keyframe_distance() -> u32 {
    30
}
fn default_min_quantizer() -> u32 {
    4
}
fn default_max_quantizer() -> u32 {
    48
}
fn default_low_res_floor() -> (u32, u32) {
    (640, 360)
}
fn default_true() -> bool {
    true
}
fn default_sample_rate() -> u32 {
    48000
}
fn default_channels() -> u16 {
    2
}
fn default_queue_capacity() -> usize {
    12
}
fn default_trim_depth_threshold() -> usize {
    4
}
fn default_pacer_max_wait_ms() -> u64 {
    1_000
}
fn default_stream_timeout_secs() -> u64 {
    5
}
fn default_rtcp_timeout_secs() -> u64 {
    5
}
fn default_initial_rtp_read_secs() -> u64 {
    2
}
fn default_reconnect_attempts() -> u32 {
    10
}
fn default_reconnect_interval_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: Config = toml::from_str("").expect("empty string deserializes to defaults");
        assert_eq!(config.signaling.http_timeout_secs, 30);
        assert_eq!(config.video.codec, VideoCodec::Vp8);
        assert_eq!(config.video.bitrate_bps, 5_000_000);
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.channels, 2);
        assert_eq!(config.pipeline.queue_capacity, 12);
        assert_eq!(config.pipeline.trim_depth_threshold, 4);
        assert_eq!(config.timeouts.reconnect_attempts, 10);
    }

    #[test]
    fn partial_config_only_video_section() {
        let toml_str = r#"
[video]
bitrate_bps = 2000000
codec = "vp9"
"#;
        let config: Config = toml::from_str(toml_str).expect("partial config deserializes");
        assert_eq!(config.video.bitrate_bps, 2_000_000);
        assert_eq!(config.video.codec, VideoCodec::Vp9);
        assert_eq!(config.video.max_keyframe_distance, 30);
        assert_eq!(config.audio.sample_rate, 48000);
    }

    #[test]
    fn validate_requires_url() {
        let config = Config::default();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("signaling.url")));
    }

    #[test]
    fn validate_rejects_bad_sample_rate() {
        let mut config = Config::default();
        config.signaling.url = "https://example.com/whep".to_string();
        config.audio.sample_rate = 44100;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("sample_rate")));
    }

    #[test]
    fn validate_rejects_inverted_quantizer_bounds() {
        let mut config = Config::default();
        config.signaling.url = "https://example.com/whep".to_string();
        config.video.min_quantizer = 50;
        config.video.max_quantizer = 10;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("quantizer")));
    }

    #[test]
    fn validate_passes_with_good_url_and_defaults() {
        let mut config = Config::default();
        config.signaling.url = "https://whep.example.com/ingest".to_string();
        assert!(config.validate().is_ok());
    }
}
