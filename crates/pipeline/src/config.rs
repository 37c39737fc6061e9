use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::error::PipelineError;

/// Capture resolution requested from the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1080p")]
    FullHd,
    #[serde(rename = "4K")]
    Uhd,
}

impl Resolution {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Resolution::FullHd => "1080p",
            Resolution::Uhd => "4K",
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "1080p" => Ok(Resolution::FullHd),
            "4K" | "4k" => Ok(Resolution::Uhd),
            other => Err(format!("unsupported resolution '{}' (expected 1080p or 4K)", other)),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// Capture orientation requested from the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Landscape,
    Portrait,
}

impl Orientation {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Orientation::Landscape => "landscape",
            Orientation::Portrait => "portrait",
        }
    }
}

impl FromStr for Orientation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "landscape" => Ok(Orientation::Landscape),
            "portrait" => Ok(Orientation::Portrait),
            other => Err(format!("unsupported orientation '{}' (expected landscape or portrait)", other)),
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// Fixed transcoding profile handed to ffmpeg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeProfile {
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub frame_rate: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    /// Extension of the encoded file in the video directory
    pub container: String,
}

impl Default for EncodeProfile {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            preset: "fast".to_string(),
            crf: 18,
            frame_rate: 60,
            audio_codec: "aac".to_string(),
            audio_bitrate: "384k".to_string(),
            container: "mp4".to_string(),
        }
    }
}

/// Configuration for the manifest pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Parent of the new/error/success/video directories
    pub store_root: PathBuf,
    /// Maximum number of watcher-admitted jobs rendering at once
    pub max_concurrent_jobs: usize,
    /// Quiet period before a burst of create events for one file fires
    pub debounce_ms: u64,
    /// Pause before processing a watcher-admitted file, so slow writers can finish
    pub settle_delay_ms: u64,
    /// Delay between an interrupt and process exit
    pub shutdown_grace_ms: u64,
    pub node_bin: PathBuf,
    /// Recorder script, relative paths resolve against the executable's directory
    pub recorder_script: PathBuf,
    pub ffmpeg_bin: PathBuf,
    /// Kill an external tool that is still running after this many seconds
    pub subprocess_timeout_secs: Option<u64>,
    pub resolution: Resolution,
    pub orientation: Orientation,
    pub debug: bool,
    pub operating_system: String,
    pub environment: String,
    /// Where foreground runs copy finished videos
    pub output_dir: PathBuf,
    pub encode: EncodeProfile,
    /// Raw capture extension written by the recorder
    pub raw_extension: String,
    pub balance_debit_per_job: i64,
    pub upload_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl PipelineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            store_root: PathBuf::from("../tmp/v3"),
            max_concurrent_jobs: 2, // a single render can take most of an 8GB box
            debounce_ms: 500,
            settle_delay_ms: 2000,
            shutdown_grace_ms: 1000,
            node_bin: PathBuf::from("node"),
            recorder_script: PathBuf::from("puppeteer-runner/recordVideoV3.js"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            subprocess_timeout_secs: None,
            resolution: Resolution::FullHd,
            orientation: Orientation::Landscape,
            debug: false,
            operating_system: std::env::consts::OS.to_string(),
            environment: "local".to_string(),
            output_dir: PathBuf::from("."),
            encode: EncodeProfile::default(),
            raw_extension: "webm".to_string(),
            balance_debit_per_job: 10,
            upload_prefix: "v3/video".to_string(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.apply_env();
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Environment variables win over file values
    pub fn apply_env(&mut self) {
        if let Ok(os) = std::env::var("OPERATING_SYSTEM") {
            if !os.is_empty() {
                self.operating_system = os;
            }
        }
        if let Ok(env) = std::env::var("ENVIRONMENT") {
            if !env.is_empty() {
                self.environment = env;
            }
        }
    }

    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        if self.max_concurrent_jobs == 0 {
            return Err(PipelineError::Configuration(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.debounce_ms == 0 {
            return Err(PipelineError::Configuration(
                "debounce_ms must be greater than zero".to_string(),
            ));
        }
        if self.raw_extension.is_empty() || self.encode.container.is_empty() {
            return Err(PipelineError::Configuration(
                "raw_extension and encode.container must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn subprocess_timeout(&self) -> Option<Duration> {
        self.subprocess_timeout_secs.map(Duration::from_secs)
    }

    /// Recorder script path, anchored at the executable's directory when relative
    pub fn resolved_recorder_script(&self) -> PathBuf {
        if self.recorder_script.is_absolute() {
            return self.recorder_script.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&self.recorder_script)))
            .unwrap_or_else(|| self.recorder_script.clone())
    }
}
