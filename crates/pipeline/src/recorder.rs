use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use log::info;
use crate::config::{Orientation, PipelineConfig, Resolution};
use crate::error::{PipelineError, PipelineResult};
use crate::job::Job;
use crate::progress::{parse_recorder_line, ProgressCallback};
use crate::subprocess::run_streaming;

/// Drives the browser recording of a job into a raw capture file
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Record `job`, leaving the capture at `raw_output`. Progress values are stage-local (0-100).
    async fn record(&self, job: &Job, raw_output: &Path, on_progress: ProgressCallback) -> PipelineResult<()>;
}

/// Runs the node recording script, which writes `<video dir>/<id>.<raw ext>` itself
#[derive(Debug, Clone)]
pub struct NodeRecorder {
    pub node_bin: PathBuf,
    pub script: PathBuf,
    pub operating_system: String,
    pub resolution: Resolution,
    pub orientation: Orientation,
    pub debug: bool,
    pub time_limit: Option<Duration>,
}

impl NodeRecorder {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            node_bin: cfg.node_bin.clone(),
            script: cfg.resolved_recorder_script(),
            operating_system: cfg.operating_system.clone(),
            resolution: cfg.resolution,
            orientation: cfg.orientation,
            debug: cfg.debug,
            time_limit: cfg.subprocess_timeout(),
        }
    }

    /// Arguments after the node binary
    pub fn build_args(&self, job_id: &str) -> Vec<String> {
        let mut args = vec![
            self.script.to_string_lossy().to_string(),
            "--uuid".to_string(),
            job_id.to_string(),
            "--os".to_string(),
            self.operating_system.clone(),
            "--resolution".to_string(),
            self.resolution.as_arg().to_string(),
            "--orientation".to_string(),
            self.orientation.as_arg().to_string(),
        ];
        if self.debug {
            args.push("--debug".to_string());
        }
        args
    }
}

#[async_trait]
impl Recorder for NodeRecorder {
    async fn record(&self, job: &Job, _raw_output: &Path, on_progress: ProgressCallback) -> PipelineResult<()> {
        if !self.script.is_file() {
            return Err(PipelineError::Configuration(format!(
                "recorder script not found at {}",
                self.script.display()
            )));
        }
        info!("Job {}: recording with {}", job.id, self.script.display());

        let args = self.build_args(&job.id);
        run_streaming("recorder", &self.node_bin, &args, self.time_limit, move |line| {
            if let Some(value) = parse_recorder_line(line) {
                on_progress(value);
            }
        })
        .await
    }
}
