pub mod collaborators;
pub mod config;
pub mod debounce;
pub mod encoder;
pub mod error;
pub mod job;
pub mod limiter;
pub mod processor;
pub mod progress;
pub mod project;
pub mod recorder;
pub mod render;
pub mod store;
pub mod subprocess;
pub mod telemetry;
pub mod watcher;

pub use config::{Orientation, PipelineConfig, Resolution};
pub use error::{PipelineError, PipelineResult};
pub use job::Job;
pub use processor::{EntryMode, JobOutcome, JobProcessor, ProcessorSettings, Stage};
pub use store::{DirJobStore, JobStore, StoreDir};
