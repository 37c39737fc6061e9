use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use log::info;
use crate::config::{EncodeProfile, PipelineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::progress::{parse_encoder_line, ProgressCallback};
use crate::subprocess::run_streaming;

/// Transcodes a raw capture into the deliverable format
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, input: &Path, output: &Path, on_progress: ProgressCallback) -> PipelineResult<()>;
}

/// ffmpeg with a fixed quality / frame-rate / codec profile
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    pub ffmpeg_bin: PathBuf,
    pub profile: EncodeProfile,
    pub time_limit: Option<Duration>,
}

impl FfmpegEncoder {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            profile: cfg.encode.clone(),
            time_limit: cfg.subprocess_timeout(),
        }
    }

    /// Build the ffmpeg argument list; progress goes to stdout as `key=value` lines
    pub fn build_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let p = &self.profile;
        vec![
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-c:v".to_string(),
            p.video_codec.clone(),
            "-preset".to_string(),
            p.preset.clone(),
            "-crf".to_string(),
            p.crf.to_string(),
            "-r".to_string(),
            p.frame_rate.to_string(),
            "-c:a".to_string(),
            p.audio_codec.clone(),
            "-b:a".to_string(),
            p.audio_bitrate.clone(),
            "-progress".to_string(),
            "pipe:1".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }
}

fn absolute(path: &Path) -> PipelineResult<PathBuf> {
    std::path::absolute(path).map_err(|e| PipelineError::io(path, e))
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(&self, input: &Path, output: &Path, on_progress: ProgressCallback) -> PipelineResult<()> {
        let input = absolute(input)?;
        if !input.is_file() {
            return Err(PipelineError::subprocess(
                self.ffmpeg_bin.display().to_string(),
                format!("input file {} does not exist", input.display()),
            ));
        }

        let output = absolute(output)?;
        if let Some(dir) = output.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| PipelineError::io(dir, e))?;
        }

        info!("Converting {} to {}", input.display(), output.display());
        let args = self.build_args(&input, &output);
        run_streaming("ffmpeg", &self.ffmpeg_bin, &args, self.time_limit, move |line| {
            if let Some(value) = parse_encoder_line(line) {
                on_progress(value);
            }
        })
        .await
    }
}
