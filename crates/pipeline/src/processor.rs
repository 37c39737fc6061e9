use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use chrono::Local;
use log::{debug, error, info, warn};
use crate::collaborators::{EventSink, LogEventSink, PipelineEvent, Publishers, Recipient};
use crate::config::PipelineConfig;
use crate::encoder::Encoder;
use crate::error::{PipelineError, PipelineResult};
use crate::job::Job;
use crate::progress::{ProgressCallback, ProgressSegment};
use crate::recorder::Recorder;
use crate::render::{ProgressSink, SilentProgress};
use crate::store::{JobStore, StoreDir};
use crate::telemetry::memory_usage_percent;

/// Message recorded on a job whose recording step failed
pub const RECORDING_FAILED: &str = "recording failed";

/// How a job reached the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryMode {
    /// Interactive run: progress on the console, no publishing, result copied for the user.
    /// With a `destination`, the encoder writes straight there and the file is kept.
    Foreground { destination: Option<PathBuf> },
    /// Watcher-admitted run: silent, published to the remote collaborators
    Service,
}

impl EntryMode {
    fn is_foreground(&self) -> bool {
        matches!(self, EntryMode::Foreground { .. })
    }

    fn destination(&self) -> Option<&Path> {
        match self {
            EntryMode::Foreground { destination } => destination.as_deref(),
            EntryMode::Service => None,
        }
    }
}

/// Pipeline states, strictly sequential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Submitted,
    Recording,
    Encoding,
    Publishing,
    Success,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Submitted => "submitted",
            Stage::Recording => "recording",
            Stage::Encoding => "encoding",
            Stage::Publishing => "publishing",
            Stage::Success => "success",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What happened to one record
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Record is in `success`; `output` is the user-visible copy in foreground mode
    Succeeded { id: String, output: Option<PathBuf> },
    /// Record is in `error` (best effort) with `message` in its `error` field.
    /// `stage` is `Success` when only the final move to `success` failed.
    Failed { id: String, stage: Stage, message: String },
    /// Nothing durable was written: the record was unreadable or already gone
    Abandoned { path: PathBuf, reason: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded { .. })
    }
}

/// Values the processor needs from the configuration
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub raw_extension: String,
    pub encoded_extension: String,
    /// Where foreground runs without a destination leave `CodeVideo-<timestamp>.<ext>`
    pub output_dir: PathBuf,
    pub upload_prefix: String,
    pub balance_debit_per_job: i64,
}

impl ProcessorSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            raw_extension: cfg.raw_extension.clone(),
            encoded_extension: cfg.encode.container.clone(),
            output_dir: cfg.output_dir.clone(),
            upload_prefix: cfg.upload_prefix.clone(),
            balance_debit_per_job: cfg.balance_debit_per_job,
        }
    }
}

enum PublishFailure {
    /// The owner was never told; the record is routed to `error` right away
    Notification(PipelineError),
    Other(PipelineError),
}

/// Drives one record through Submitted → Recording → Encoding → (Publishing) → Success,
/// or to Failed from any of them.
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    recorder: Arc<dyn Recorder>,
    encoder: Arc<dyn Encoder>,
    publishers: Publishers,
    events: Arc<dyn EventSink>,
    progress: Arc<dyn ProgressSink>,
    settings: ProcessorSettings,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        recorder: Arc<dyn Recorder>,
        encoder: Arc<dyn Encoder>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            recorder,
            encoder,
            publishers: Publishers::unconfigured(),
            events: Arc::new(LogEventSink),
            progress: Arc::new(SilentProgress),
            settings,
        }
    }

    pub fn with_publishers(mut self, publishers: Publishers) -> Self {
        self.publishers = publishers;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Console sink used in foreground mode; service runs never report
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Process the record at `path` to a terminal state. Never panics, never returns early
    /// without either relocating the record or explaining why it could not.
    pub async fn process(&self, path: &Path, mode: &EntryMode) -> JobOutcome {
        let foreground = mode.is_foreground();
        if foreground {
            // narration already took 0-10
            self.progress.report(10.0, "Starting up video recording...");
        }

        let job = match self.store.read(path) {
            Ok(job) => job,
            Err(PipelineError::RecordVanished(_)) => {
                info!("{} is gone, assuming it was already processed", path.display());
                return self.abandon(path, "already processed");
            }
            Err(e) => {
                error!("Failed to load job record: {}", e);
                return self.abandon(path, &e.to_string());
            }
        };
        info!("Job {}: submitted ({} work item(s))", job.id, job.work_items.len());

        let video_dir = self.store.video_dir();
        let raw = video_dir.join(format!("{}.{}", job.id, self.settings.raw_extension));
        let scratch_encoded = video_dir.join(format!("{}.{}", job.id, self.settings.encoded_extension));
        let encoded = mode
            .destination()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| scratch_encoded.clone());

        // Recording
        info!("Job {}: 🎬 recording", job.id);
        let on_progress = self.stage_progress(foreground, ProgressSegment::RECORDING, "Rendering video...");
        if let Err(e) = self.recorder.record(&job, &raw, on_progress).await {
            error!("Job {}: ❌ recording failed: {}", job.id, e);
            self.remove_files(&job.id, &[raw.as_path(), scratch_encoded.as_path()]);
            return self.fail(path, &job.id, Stage::Recording, RECORDING_FAILED.to_string());
        }

        // Encoding
        info!("Job {}: 🔄 converting {} to {}", job.id, raw.display(), encoded.display());
        let on_progress = self.stage_progress(foreground, ProgressSegment::ENCODING, "Converting video...");
        if let Err(e) = self.encoder.encode(&raw, &encoded, on_progress).await {
            error!("Job {}: ❌ conversion failed: {}", job.id, e);
            self.remove_files(&job.id, &[raw.as_path(), encoded.as_path()]);
            return self.fail(path, &job.id, Stage::Encoding, format!("failed to convert video: {}", e));
        }
        info!("Job {}: converted to {}", job.id, encoded.display());

        // Publishing
        if !foreground {
            match self.publish(&job, &encoded).await {
                Ok(()) => {}
                Err(PublishFailure::Notification(e)) => {
                    let message = e.to_string();
                    warn!("Job {}: notification failed, keeping {} for inspection", job.id, encoded.display());
                    self.route_to_error(path, &job.id, &message);
                    return self.failed_outcome(&job.id, Stage::Publishing, message);
                }
                Err(PublishFailure::Other(e)) => {
                    return self.fail(path, &job.id, Stage::Publishing, e.to_string());
                }
            }
        }

        // Success
        if let Err(e) = self.store.move_to(path, StoreDir::Success) {
            error!("Job {}: failed to move record to success: {}", job.id, e);
            self.remove_files(&job.id, &[raw.as_path(), encoded.as_path()]);
            return match e {
                // another admission finished it first
                PipelineError::RecordVanished(_) => self.abandon(path, "already processed"),
                e => self.fail(path, &job.id, Stage::Success, format!("failed to move record to success: {}", e)),
            };
        }
        info!("Job {}: ✅ processed successfully", job.id);
        self.events.emit(PipelineEvent::JobSucceeded {
            id: job.id.clone(),
            memory_usage_percent: memory_usage_percent(),
        });

        let output = match mode {
            EntryMode::Foreground { destination: Some(dest) } => Some(dest.clone()),
            EntryMode::Foreground { destination: None } => self.copy_for_user(&job.id, &encoded),
            EntryMode::Service => None,
        };
        if foreground {
            self.progress.report(100.0, "Done");
            self.progress.finish();
        }

        if mode.destination().is_some() {
            self.remove_files(&job.id, &[raw.as_path()]);
        } else {
            self.remove_files(&job.id, &[raw.as_path(), encoded.as_path()]);
        }

        JobOutcome::Succeeded { id: job.id, output }
    }

    fn stage_progress(&self, foreground: bool, segment: ProgressSegment, label: &'static str) -> ProgressCallback {
        if !foreground {
            return Arc::new(|_: f64| {});
        }
        let sink = self.progress.clone();
        Arc::new(move |local: f64| sink.report(segment.rescale(local), label))
    }

    async fn publish(&self, job: &Job, encoded: &Path) -> Result<(), PublishFailure> {
        let bytes = tokio::fs::read(encoded)
            .await
            .map_err(|e| PublishFailure::Other(PipelineError::io(encoded, e)))?;

        let file_name = format!("{}.{}", job.id, self.settings.encoded_extension);
        info!("Job {}: uploading {} bytes as {}/{}", job.id, bytes.len(), self.settings.upload_prefix, file_name);
        let url = self
            .publishers
            .uploader
            .upload(bytes, &self.settings.upload_prefix, &file_name)
            .await
            .map_err(PublishFailure::Other)?;
        info!("Job {}: uploaded to {}", job.id, url);

        let recipient = Recipient {
            user_id: job.owner_id.clone(),
            environment: job.environment.clone(),
        };
        self.publishers
            .notifier
            .notify(&recipient, &url)
            .await
            .map_err(PublishFailure::Notification)?;
        info!("Job {}: notified {}", job.id, recipient.user_id);

        self.publishers
            .ledger
            .adjust_balance(&job.owner_id, -self.settings.balance_debit_per_job)
            .await
            .map_err(PublishFailure::Other)?;
        debug!("Job {}: debited {} token(s) from {}", job.id, self.settings.balance_debit_per_job, job.owner_id);
        Ok(())
    }

    fn copy_for_user(&self, id: &str, encoded: &Path) -> Option<PathBuf> {
        let file_name = format!(
            "CodeVideo-{}.{}",
            Local::now().format("%Y-%m-%d-%H-%M-%S"),
            self.settings.encoded_extension
        );
        let target = self.settings.output_dir.join(file_name);
        match copy_file(encoded, &target) {
            Ok(()) => {
                info!("Job {}: saved {}", id, target.display());
                Some(target)
            }
            Err(e) => {
                error!("Job {}: failed to copy output file: {}", id, e);
                None
            }
        }
    }

    /// Annotate, relocate and report. Every step is best effort.
    fn fail(&self, path: &Path, id: &str, stage: Stage, message: String) -> JobOutcome {
        self.route_to_error(path, id, &message);
        self.failed_outcome(id, stage, message)
    }

    fn route_to_error(&self, path: &Path, id: &str, message: &str) {
        self.store.annotate_error(path, message);
        match self.store.move_to(path, StoreDir::Error) {
            Ok(dest) => info!("Job {}: record moved to {}", id, dest.display()),
            Err(e) => error!("Job {}: failed to move record to error: {}", id, e),
        }
    }

    fn failed_outcome(&self, id: &str, stage: Stage, message: String) -> JobOutcome {
        self.progress.finish();
        self.events.emit(PipelineEvent::JobFailed {
            id: id.to_string(),
            stage: stage.to_string(),
            message: message.clone(),
        });
        JobOutcome::Failed {
            id: id.to_string(),
            stage,
            message,
        }
    }

    fn abandon(&self, path: &Path, reason: &str) -> JobOutcome {
        self.progress.finish();
        JobOutcome::Abandoned {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    fn remove_files(&self, id: &str, files: &[&Path]) {
        for file in files {
            match std::fs::remove_file(file) {
                Ok(()) => debug!("Job {}: removed {}", id, file.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Job {}: failed to remove {}: {}", id, file.display(), e),
            }
        }
    }
}

fn copy_file(from: &Path, to: &Path) -> PipelineResult<()> {
    if let Some(dir) = to.parent() {
        std::fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
    }
    std::fs::copy(from, to).map_err(|e| PipelineError::io(to, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use async_trait::async_trait;
    use crate::collaborators::{Ledger, Notifier, Uploader};
    use crate::store::{DirJobStore, MemoryJobStore};

    /// Writes the raw capture and reports progress, or exits "non-zero"
    struct FakeRecorder {
        succeed: bool,
    }

    #[async_trait]
    impl Recorder for FakeRecorder {
        async fn record(&self, _job: &Job, raw_output: &Path, on_progress: ProgressCallback) -> PipelineResult<()> {
            std::fs::create_dir_all(raw_output.parent().unwrap()).unwrap();
            std::fs::write(raw_output, b"partial capture").unwrap();
            on_progress(50.0);
            if self.succeed {
                on_progress(100.0);
                Ok(())
            } else {
                Err(PipelineError::subprocess("node", "recorder exited with status 1"))
            }
        }
    }

    #[derive(Default)]
    struct FakeEncoder {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Encoder for FakeEncoder {
        async fn encode(&self, input: &Path, output: &Path, on_progress: ProgressCallback) -> PipelineResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(input.is_file(), "encoder ran without a raw capture");
            if let Some(dir) = output.parent() {
                std::fs::create_dir_all(dir).unwrap();
            }
            std::fs::write(output, b"encoded video").unwrap();
            if self.fail {
                return Err(PipelineError::subprocess("ffmpeg", "ffmpeg exited with status 1"));
            }
            on_progress(100.0);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingProgress(Mutex<Vec<f64>>);

    impl ProgressSink for RecordingProgress {
        fn report(&self, percentage: f64, _label: &str) {
            self.0.lock().unwrap().push(percentage);
        }
    }

    #[derive(Default)]
    struct CollectedEvents(Mutex<Vec<PipelineEvent>>);

    impl EventSink for CollectedEvents {
        fn emit(&self, event: PipelineEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[derive(Default)]
    struct FakeRemote {
        fail_upload: bool,
        fail_notify: bool,
        fail_ledger: bool,
        uploads: Mutex<Vec<(usize, String, String)>>,
        debits: Mutex<Vec<(String, i64)>>,
    }

    #[async_trait]
    impl Uploader for FakeRemote {
        async fn upload(&self, bytes: Vec<u8>, path_prefix: &str, file_name: &str) -> PipelineResult<String> {
            if self.fail_upload {
                return Err(PipelineError::collaborator("uploader", "bucket unavailable"));
            }
            self.uploads
                .lock()
                .unwrap()
                .push((bytes.len(), path_prefix.to_string(), file_name.to_string()));
            Ok(format!("https://cdn.example/{}/{}", path_prefix, file_name))
        }
    }

    #[async_trait]
    impl Notifier for FakeRemote {
        async fn notify(&self, _recipient: &Recipient, _url: &str) -> PipelineResult<()> {
            if self.fail_notify {
                return Err(PipelineError::collaborator("notifier", "mail rejected"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Ledger for FakeRemote {
        async fn adjust_balance(&self, user_id: &str, delta: i64) -> PipelineResult<()> {
            if self.fail_ledger {
                return Err(PipelineError::collaborator("ledger", "user not found"));
            }
            self.debits.lock().unwrap().push((user_id.to_string(), delta));
            Ok(())
        }
    }

    struct Harness {
        _root: tempfile::TempDir,
        store: Arc<DirJobStore>,
        encoder: Arc<FakeEncoder>,
        progress: Arc<RecordingProgress>,
        events: Arc<CollectedEvents>,
        output_dir: PathBuf,
    }

    impl Harness {
        fn new(encoder: FakeEncoder) -> Self {
            let root = tempfile::tempdir().unwrap();
            let store = Arc::new(DirJobStore::new(root.path().join("v3")));
            store.ensure_dirs().unwrap();
            let output_dir = root.path().join("out");
            Self {
                _root: root,
                store,
                encoder: Arc::new(encoder),
                progress: Arc::new(RecordingProgress::default()),
                events: Arc::new(CollectedEvents::default()),
                output_dir,
            }
        }

        fn processor(&self, recorder_ok: bool, remote: Arc<FakeRemote>) -> JobProcessor {
            let settings = ProcessorSettings {
                output_dir: self.output_dir.clone(),
                ..ProcessorSettings::from_config(&PipelineConfig::default_config())
            };
            JobProcessor::new(
                self.store.clone(),
                Arc::new(FakeRecorder { succeed: recorder_ok }),
                self.encoder.clone(),
                settings,
            )
            .with_publishers(Publishers {
                uploader: remote.clone(),
                notifier: remote.clone(),
                ledger: remote,
            })
            .with_events(self.events.clone())
            .with_progress(self.progress.clone())
        }

        fn submit(&self, id: &str) -> PathBuf {
            let mut job = Job::new(id);
            job.owner_id = "user_1".to_string();
            job.environment = "staging".to_string();
            job.work_items = vec![
                serde_json::json!({"name": "author-speak-before", "value": "hello"}),
                serde_json::json!({"name": "type-editor", "value": "fn main() {}"}),
            ];
            self.store.write(&job).unwrap()
        }

        fn video_files(&self) -> Vec<PathBuf> {
            std::fs::read_dir(self.store.dir(StoreDir::Video))
                .unwrap()
                .map(|e| e.unwrap().path())
                .collect()
        }

        fn terminal_count(&self, id: &str) -> usize {
            [StoreDir::Success, StoreDir::Error]
                .iter()
                .filter(|d| self.store.contains(**d, id))
                .count()
        }
    }

    #[tokio::test]
    async fn test_foreground_success_copies_and_cleans_up() {
        let h = Harness::new(FakeEncoder::default());
        let path = h.submit("abc");
        let outcome = h
            .processor(true, Arc::new(FakeRemote::default()))
            .process(&path, &EntryMode::Foreground { destination: None })
            .await;

        let JobOutcome::Succeeded { id, output: Some(output) } = outcome else {
            panic!("unexpected outcome: {:?}", outcome);
        };
        assert_eq!(id, "abc");
        assert!(output.starts_with(&h.output_dir));
        let name = output.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("CodeVideo-") && name.ends_with(".mp4"), "{}", name);
        assert_eq!(std::fs::read(&output).unwrap(), b"encoded video");

        assert!(h.store.contains(StoreDir::Success, "abc"));
        assert_eq!(h.terminal_count("abc"), 1);
        assert!(h.video_files().is_empty());
    }

    #[tokio::test]
    async fn test_foreground_custom_destination_is_kept() {
        let h = Harness::new(FakeEncoder::default());
        let path = h.submit("abc");
        let dest = h.output_dir.join("lesson.mp4");
        let outcome = h
            .processor(true, Arc::new(FakeRemote::default()))
            .process(&path, &EntryMode::Foreground { destination: Some(dest.clone()) })
            .await;

        assert_eq!(
            outcome,
            JobOutcome::Succeeded {
                id: "abc".to_string(),
                output: Some(dest.clone())
            }
        );
        assert!(dest.is_file());
        assert!(h.video_files().is_empty());
        assert!(h.store.contains(StoreDir::Success, "abc"));
    }

    #[tokio::test]
    async fn test_recording_failure() {
        let h = Harness::new(FakeEncoder::default());
        let path = h.submit("abc");
        let outcome = h
            .processor(false, Arc::new(FakeRemote::default()))
            .process(&path, &EntryMode::Foreground { destination: None })
            .await;

        assert_eq!(
            outcome,
            JobOutcome::Failed {
                id: "abc".to_string(),
                stage: Stage::Recording,
                message: "recording failed".to_string()
            }
        );
        assert_eq!(h.encoder.calls.load(Ordering::SeqCst), 0);
        assert!(h.video_files().is_empty());
        assert_eq!(h.terminal_count("abc"), 1);

        let record = h.store.read(&h.store.dir(StoreDir::Error).join("abc.json")).unwrap();
        assert_eq!(record.error.as_deref(), Some("recording failed"));
        assert_eq!(record.work_items.len(), 2);
    }

    #[tokio::test]
    async fn test_encoding_failure_removes_partial_files() {
        let h = Harness::new(FakeEncoder {
            fail: true,
            ..Default::default()
        });
        let path = h.submit("abc");
        let outcome = h
            .processor(true, Arc::new(FakeRemote::default()))
            .process(&path, &EntryMode::Service)
            .await;

        let JobOutcome::Failed { stage, message, .. } = outcome else {
            panic!("unexpected outcome: {:?}", outcome);
        };
        assert_eq!(stage, Stage::Encoding);
        assert!(message.starts_with("failed to convert video: "), "{}", message);
        assert!(h.video_files().is_empty());

        let record = h.store.read(&h.store.dir(StoreDir::Error).join("abc.json")).unwrap();
        assert_eq!(record.error, Some(message));
    }

    #[tokio::test]
    async fn test_service_success_publishes() {
        let h = Harness::new(FakeEncoder::default());
        let remote = Arc::new(FakeRemote::default());
        let path = h.submit("abc");
        let outcome = h.processor(true, remote.clone()).process(&path, &EntryMode::Service).await;

        assert_eq!(
            outcome,
            JobOutcome::Succeeded {
                id: "abc".to_string(),
                output: None
            }
        );
        assert_eq!(
            *remote.uploads.lock().unwrap(),
            vec![(13, "v3/video".to_string(), "abc.mp4".to_string())]
        );
        assert_eq!(*remote.debits.lock().unwrap(), vec![("user_1".to_string(), -10)]);
        assert!(h.video_files().is_empty());
        // service runs stay silent
        assert!(h.progress.0.lock().unwrap().is_empty());

        let events = h.events.0.lock().unwrap();
        assert!(matches!(&events[..], [PipelineEvent::JobSucceeded { id, .. }] if id == "abc"));
    }

    #[tokio::test]
    async fn test_upload_failure_moves_record_to_error() {
        let h = Harness::new(FakeEncoder::default());
        let remote = Arc::new(FakeRemote {
            fail_upload: true,
            ..Default::default()
        });
        let path = h.submit("abc");
        let outcome = h.processor(true, remote.clone()).process(&path, &EntryMode::Service).await;

        assert!(matches!(outcome, JobOutcome::Failed { stage: Stage::Publishing, .. }));
        assert!(h.store.contains(StoreDir::Error, "abc"));
        assert!(remote.debits.lock().unwrap().is_empty());
        // encoded file kept for inspection
        assert!(h.store.dir(StoreDir::Video).join("abc.mp4").is_file());
    }

    #[tokio::test]
    async fn test_notification_failure_routes_to_error_without_debit() {
        let h = Harness::new(FakeEncoder::default());
        let remote = Arc::new(FakeRemote {
            fail_notify: true,
            ..Default::default()
        });
        let path = h.submit("abc");
        let outcome = h.processor(true, remote.clone()).process(&path, &EntryMode::Service).await;

        let JobOutcome::Failed { stage, message, .. } = outcome else {
            panic!("unexpected outcome: {:?}", outcome);
        };
        assert_eq!(stage, Stage::Publishing);
        assert_eq!(message, "notifier failed: mail rejected");
        assert_eq!(h.terminal_count("abc"), 1);
        assert!(h.store.contains(StoreDir::Error, "abc"));
        assert!(remote.debits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_failure_fails_job() {
        let h = Harness::new(FakeEncoder::default());
        let remote = Arc::new(FakeRemote {
            fail_ledger: true,
            ..Default::default()
        });
        let path = h.submit("abc");
        let outcome = h.processor(true, remote).process(&path, &EntryMode::Service).await;
        assert!(matches!(outcome, JobOutcome::Failed { stage: Stage::Publishing, .. }));
        assert!(h.store.contains(StoreDir::Error, "abc"));
    }

    #[tokio::test]
    async fn test_foreground_progress_is_rescaled() {
        let h = Harness::new(FakeEncoder::default());
        let path = h.submit("abc");
        h.processor(true, Arc::new(FakeRemote::default()))
            .process(&path, &EntryMode::Foreground { destination: None })
            .await;

        // start, recorder 50 and 100, encoder 100, done
        assert_eq!(*h.progress.0.lock().unwrap(), vec![10.0, 50.0, 90.0, 100.0, 100.0]);
    }

    #[tokio::test]
    async fn test_malformed_record_is_abandoned_in_place() {
        let h = Harness::new(FakeEncoder::default());
        let path = h.store.dir(StoreDir::New).join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let outcome = h
            .processor(true, Arc::new(FakeRemote::default()))
            .process(&path, &EntryMode::Service)
            .await;
        assert!(matches!(outcome, JobOutcome::Abandoned { .. }));
        assert!(path.is_file());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
        assert_eq!(h.encoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_admission_of_same_record_is_abandoned() {
        let h = Harness::new(FakeEncoder::default());
        let path = h.submit("abc");
        let processor = h.processor(true, Arc::new(FakeRemote::default()));

        assert!(processor.process(&path, &EntryMode::Service).await.is_success());
        let again = processor.process(&path, &EntryMode::Service).await;
        assert_eq!(
            again,
            JobOutcome::Abandoned {
                path: path.clone(),
                reason: "already processed".to_string()
            }
        );
        assert_eq!(h.terminal_count("abc"), 1);
        assert_eq!(h.encoder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_memory_store_backs_the_same_pipeline() {
        let video = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new(video.path()));
        let path = store.write(&Job::new("abc")).unwrap();

        let processor = JobProcessor::new(
            store.clone(),
            Arc::new(FakeRecorder { succeed: false }),
            Arc::new(FakeEncoder::default()),
            ProcessorSettings::from_config(&PipelineConfig::default_config()),
        );
        let outcome = processor.process(&path, &EntryMode::Service).await;
        assert!(matches!(outcome, JobOutcome::Failed { stage: Stage::Recording, .. }));

        let raw = store.raw(StoreDir::Error, "abc").unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["error"], "recording failed");
        assert!(store.raw(StoreDir::New, "abc").is_none());
    }

    /// Delegates to a `MemoryJobStore` except that moving into `success` fails
    struct FailingSuccessMove {
        inner: MemoryJobStore,
        vanish: bool,
    }

    impl JobStore for FailingSuccessMove {
        fn write(&self, job: &Job) -> PipelineResult<PathBuf> {
            self.inner.write(job)
        }

        fn read(&self, path: &Path) -> PipelineResult<Job> {
            self.inner.read(path)
        }

        fn move_to(&self, path: &Path, target: StoreDir) -> PipelineResult<PathBuf> {
            match target {
                StoreDir::Success if self.vanish => Err(PipelineError::RecordVanished(path.to_path_buf())),
                StoreDir::Success => Err(PipelineError::io(
                    path,
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
                )),
                _ => self.inner.move_to(path, target),
            }
        }

        fn annotate_error(&self, path: &Path, message: &str) {
            self.inner.annotate_error(path, message)
        }

        fn video_dir(&self) -> PathBuf {
            self.inner.video_dir()
        }

        fn contains(&self, dir: StoreDir, id: &str) -> bool {
            self.inner.contains(dir, id)
        }
    }

    fn failing_success_processor(store: Arc<FailingSuccessMove>, events: Arc<CollectedEvents>) -> JobProcessor {
        JobProcessor::new(
            store,
            Arc::new(FakeRecorder { succeed: true }),
            Arc::new(FakeEncoder::default()),
            ProcessorSettings::from_config(&PipelineConfig::default_config()),
        )
        .with_events(events)
    }

    #[tokio::test]
    async fn test_failed_move_to_success_is_not_reported_as_success() {
        let video = tempfile::tempdir().unwrap();
        let store = Arc::new(FailingSuccessMove {
            inner: MemoryJobStore::new(video.path()),
            vanish: false,
        });
        let events = Arc::new(CollectedEvents::default());
        let path = store.write(&Job::new("abc")).unwrap();

        let outcome = failing_success_processor(store.clone(), events.clone())
            .process(&path, &EntryMode::Foreground { destination: None })
            .await;

        let JobOutcome::Failed { stage, message, .. } = outcome else {
            panic!("unexpected outcome: {:?}", outcome);
        };
        assert_eq!(stage, Stage::Success);
        assert!(message.starts_with("failed to move record to success"), "{}", message);

        // record leaves `new` exactly once, through `error`
        assert!(store.inner.raw(StoreDir::New, "abc").is_none());
        let raw = store.inner.raw(StoreDir::Error, "abc").unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["error"], message.as_str());

        let events = events.0.lock().unwrap();
        assert!(matches!(&events[..], [PipelineEvent::JobFailed { id, .. }] if id == "abc"));
        assert_eq!(std::fs::read_dir(video.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_record_finished_elsewhere_is_abandoned() {
        let video = tempfile::tempdir().unwrap();
        let store = Arc::new(FailingSuccessMove {
            inner: MemoryJobStore::new(video.path()),
            vanish: true,
        });
        let events = Arc::new(CollectedEvents::default());
        let path = store.write(&Job::new("abc")).unwrap();

        let outcome = failing_success_processor(store, events.clone())
            .process(&path, &EntryMode::Service)
            .await;

        assert_eq!(
            outcome,
            JobOutcome::Abandoned {
                path,
                reason: "already processed".to_string()
            }
        );
        assert!(events.0.lock().unwrap().is_empty());
    }
}
