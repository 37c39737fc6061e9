use std::path::PathBuf;
use thiserror::Error;

/// Failures the pipeline distinguishes between when deciding where a job ends up
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Filesystem failure on a job-store directory or derived media file
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The job record could not be parsed; there is nothing to annotate
    #[error("job record {} is malformed: {reason}", path.display())]
    MalformedRecord { path: PathBuf, reason: String },

    /// The record disappeared before it could be read or moved (already processed)
    #[error("job record {} no longer exists", .0.display())]
    RecordVanished(PathBuf),

    /// An external tool failed to launch, timed out or exited non-zero
    #[error("{program}: {detail}")]
    Subprocess { program: String, detail: String },

    /// Upload, notification, balance or narration call failed
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    /// Required external configuration (credentials, binaries, limits) is missing or invalid
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn subprocess(program: impl Into<String>, detail: impl Into<String>) -> Self {
        PipelineError::Subprocess {
            program: program.into(),
            detail: detail.into(),
        }
    }

    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        PipelineError::Collaborator {
            collaborator,
            message: message.into(),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
