use std::sync::Arc;
use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;
use crate::error::{PipelineError, PipelineResult};

/// Who receives the "your video is ready" message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub user_id: String,
    pub environment: String,
}

/// Stores the encoded video and returns a public URL
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, path_prefix: &str, file_name: &str) -> PipelineResult<String>;
}

/// Tells the job owner where the finished video lives
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &Recipient, url: &str) -> PipelineResult<()>;
}

/// Billing: per-user token balance
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn adjust_balance(&self, user_id: &str, delta: i64) -> PipelineResult<()>;
}

/// Text-to-speech used while generating manifests; returns the hosted audio URL
#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(&self, text: &str) -> PipelineResult<String>;
}

/// Observability events emitted by the job processor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobSucceeded {
        id: String,
        memory_usage_percent: Option<f64>,
    },
    JobFailed {
        id: String,
        stage: String,
        message: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Writes events to the log as JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: PipelineEvent) {
        let rendered = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));
        match event {
            PipelineEvent::JobSucceeded { .. } => info!("event {}", rendered),
            PipelineEvent::JobFailed { .. } => warn!("event {}", rendered),
        }
    }
}

/// Stand-in for a remote service that has not been configured.
///
/// Every call fails with a `Configuration` error, so a service run without credentials
/// routes jobs to the error store instead of silently pretending to publish.
#[derive(Debug, Clone, Copy)]
pub struct Unconfigured(pub &'static str);

impl Unconfigured {
    fn fail<T>(&self) -> PipelineResult<T> {
        Err(PipelineError::Configuration(format!("{} is not configured", self.0)))
    }
}

#[async_trait]
impl Uploader for Unconfigured {
    async fn upload(&self, _bytes: Vec<u8>, _path_prefix: &str, _file_name: &str) -> PipelineResult<String> {
        self.fail()
    }
}

#[async_trait]
impl Notifier for Unconfigured {
    async fn notify(&self, _recipient: &Recipient, _url: &str) -> PipelineResult<()> {
        self.fail()
    }
}

#[async_trait]
impl Ledger for Unconfigured {
    async fn adjust_balance(&self, _user_id: &str, _delta: i64) -> PipelineResult<()> {
        self.fail()
    }
}

#[async_trait]
impl Narrator for Unconfigured {
    async fn narrate(&self, _text: &str) -> PipelineResult<String> {
        self.fail()
    }
}

/// The remote services the Publishing stage talks to
#[derive(Clone)]
pub struct Publishers {
    pub uploader: Arc<dyn Uploader>,
    pub notifier: Arc<dyn Notifier>,
    pub ledger: Arc<dyn Ledger>,
}

impl Publishers {
    pub fn unconfigured() -> Self {
        Self {
            uploader: Arc::new(Unconfigured("uploader")),
            notifier: Arc::new(Unconfigured("notifier")),
            ledger: Arc::new(Unconfigured("ledger")),
        }
    }
}
