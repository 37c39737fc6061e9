use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use log::{debug, info, warn};
use serde_json::Value;
use walkdir::WalkDir;
use crate::error::{PipelineError, PipelineResult};
use crate::job::Job;

/// Extension of job record files; anything else in `new` is ignored
pub const RECORD_EXTENSION: &str = "json";

/// The four well-known store directories. Location is the job's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreDir {
    New,
    Error,
    Success,
    Video,
}

impl StoreDir {
    pub const ALL: [StoreDir; 4] = [StoreDir::New, StoreDir::Error, StoreDir::Success, StoreDir::Video];

    pub fn name(&self) -> &'static str {
        match self {
            StoreDir::New => "new",
            StoreDir::Error => "error",
            StoreDir::Success => "success",
            StoreDir::Video => "video",
        }
    }
}

/// True for paths that look like job records
pub fn is_record_path(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION)
}

/// Persistence for job records. Moving a record between directories is the state transition.
pub trait JobStore: Send + Sync {
    /// Serialize a record into `new` as `<id>.json`
    fn write(&self, job: &Job) -> PipelineResult<PathBuf>;

    fn read(&self, path: &Path) -> PipelineResult<Job>;

    /// Relocate a record; a vanished source is `RecordVanished`, meaning already processed
    fn move_to(&self, path: &Path, target: StoreDir) -> PipelineResult<PathBuf>;

    /// Best-effort: set `error` on the record in place. Never fails the caller.
    fn annotate_error(&self, path: &Path, message: &str);

    /// Directory holding derived media for in-flight jobs
    fn video_dir(&self) -> PathBuf;

    fn contains(&self, dir: StoreDir, id: &str) -> bool;
}

fn parse_record(path: &Path, text: &str) -> PipelineResult<Job> {
    let job: Job = serde_json::from_str(text).map_err(|e| PipelineError::MalformedRecord {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !job.has_valid_id() {
        return Err(PipelineError::MalformedRecord {
            path: path.to_path_buf(),
            reason: format!("invalid id '{}'", job.id),
        });
    }
    Ok(job)
}

fn serialize_record(job: &Job) -> PipelineResult<String> {
    if !job.has_valid_id() {
        return Err(PipelineError::MalformedRecord {
            path: PathBuf::from(job.file_name()),
            reason: format!("invalid id '{}'", job.id),
        });
    }
    serde_json::to_string_pretty(job).map_err(|e| PipelineError::MalformedRecord {
        path: PathBuf::from(job.file_name()),
        reason: e.to_string(),
    })
}

/// Works on the raw document so fields the typed record doesn't know about are kept
fn with_error_field(text: &str, message: &str) -> Option<String> {
    let mut doc: Value = serde_json::from_str(text).ok()?;
    doc.as_object_mut()?
        .insert("error".to_string(), Value::String(message.to_string()));
    serde_json::to_string_pretty(&doc).ok()
}

/// Filesystem-backed store rooted at `<root>/{new,error,success,video}`
#[derive(Debug, Clone)]
pub struct DirJobStore {
    root: PathBuf,
}

impl DirJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, dir: StoreDir) -> PathBuf {
        self.root.join(dir.name())
    }

    /// Create all four directories. Failure here is fatal to the process.
    pub fn ensure_dirs(&self) -> PipelineResult<()> {
        for dir in StoreDir::ALL {
            let path = self.dir(dir);
            fs::create_dir_all(&path).map_err(|e| PipelineError::io(&path, e))?;
        }
        Ok(())
    }

    /// Records currently waiting in `new`, oldest name first
    pub fn pending(&self) -> PipelineResult<Vec<PathBuf>> {
        let new_dir = self.dir(StoreDir::New);
        let mut records = Vec::new();

        for entry in WalkDir::new(&new_dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    if e.depth() == 0 {
                        let source = e
                            .into_io_error()
                            .unwrap_or_else(|| std::io::Error::new(ErrorKind::Other, "walk failed"));
                        return Err(PipelineError::io(&new_dir, source));
                    }
                    warn!("Error reading entry in {}: {}", new_dir.display(), e);
                    continue;
                }
            };
            if entry.file_type().is_file() && is_record_path(entry.path()) {
                records.push(entry.into_path());
            }
        }

        records.sort();
        Ok(records)
    }
}

impl JobStore for DirJobStore {
    fn write(&self, job: &Job) -> PipelineResult<PathBuf> {
        let data = serialize_record(job)?;
        let new_dir = self.dir(StoreDir::New);
        fs::create_dir_all(&new_dir).map_err(|e| PipelineError::io(&new_dir, e))?;

        let path = new_dir.join(job.file_name());
        fs::write(&path, data).map_err(|e| PipelineError::io(&path, e))?;
        debug!("Job {}: wrote record to {}", job.id, path.display());
        Ok(path)
    }

    fn read(&self, path: &Path) -> PipelineResult<Job> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PipelineError::RecordVanished(path.to_path_buf()))
            }
            Err(e) => return Err(PipelineError::io(path, e)),
        };
        parse_record(path, &text)
    }

    fn move_to(&self, path: &Path, target: StoreDir) -> PipelineResult<PathBuf> {
        let file_name = path
            .file_name()
            .ok_or_else(|| PipelineError::RecordVanished(path.to_path_buf()))?;
        let target_dir = self.dir(target);
        fs::create_dir_all(&target_dir).map_err(|e| PipelineError::io(&target_dir, e))?;

        let destination = target_dir.join(file_name);
        match fs::rename(path, &destination) {
            Ok(()) => {
                info!("Moved {} to {}", path.display(), destination.display());
                Ok(destination)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PipelineError::RecordVanished(path.to_path_buf()))
            }
            Err(e) => Err(PipelineError::io(&destination, e)),
        }
    }

    fn annotate_error(&self, path: &Path, message: &str) {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                warn!("Could not read {} to record error: {}", path.display(), e);
                return;
            }
        };
        let Some(updated) = with_error_field(&text, message) else {
            warn!("Could not add error to {}: not a JSON object", path.display());
            return;
        };
        if let Err(e) = fs::write(path, updated) {
            warn!("Could not write error into {}: {}", path.display(), e);
        }
    }

    fn video_dir(&self) -> PathBuf {
        self.dir(StoreDir::Video)
    }

    fn contains(&self, dir: StoreDir, id: &str) -> bool {
        self.dir(dir).join(format!("{}.{}", id, RECORD_EXTENSION)).is_file()
    }
}

/// In-memory store keyed by virtual paths; derived media still go to a real directory
#[derive(Debug)]
pub struct MemoryJobStore {
    root: PathBuf,
    video_dir: PathBuf,
    records: Mutex<HashMap<PathBuf, String>>,
}

impl MemoryJobStore {
    pub fn new(video_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: PathBuf::from("memory"),
            video_dir: video_dir.into(),
            records: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, dir: StoreDir, file_name: &str) -> PathBuf {
        self.root.join(dir.name()).join(file_name)
    }

    /// Place arbitrary text under `new`, e.g. to simulate an externally dropped file
    pub fn insert_raw(&self, file_name: &str, text: &str) -> PathBuf {
        let key = self.key(StoreDir::New, file_name);
        self.lock().insert(key.clone(), text.to_string());
        key
    }

    pub fn raw(&self, dir: StoreDir, id: &str) -> Option<String> {
        let key = self.key(dir, &format!("{}.{}", id, RECORD_EXTENSION));
        self.lock().get(&key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, String>> {
        // A panic while holding the lock leaves the map itself intact
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JobStore for MemoryJobStore {
    fn write(&self, job: &Job) -> PipelineResult<PathBuf> {
        let data = serialize_record(job)?;
        let key = self.key(StoreDir::New, &job.file_name());
        self.lock().insert(key.clone(), data);
        Ok(key)
    }

    fn read(&self, path: &Path) -> PipelineResult<Job> {
        let text = self
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| PipelineError::RecordVanished(path.to_path_buf()))?;
        parse_record(path, &text)
    }

    fn move_to(&self, path: &Path, target: StoreDir) -> PipelineResult<PathBuf> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PipelineError::RecordVanished(path.to_path_buf()))?;
        let destination = self.key(target, file_name);

        let mut records = self.lock();
        let text = records
            .remove(path)
            .ok_or_else(|| PipelineError::RecordVanished(path.to_path_buf()))?;
        records.insert(destination.clone(), text);
        Ok(destination)
    }

    fn annotate_error(&self, path: &Path, message: &str) {
        let mut records = self.lock();
        let updated = records.get(path).and_then(|text| with_error_field(text, message));
        match updated {
            Some(text) => {
                records.insert(path.to_path_buf(), text);
            }
            None => warn!("Could not add error to {}", path.display()),
        }
    }

    fn video_dir(&self) -> PathBuf {
        self.video_dir.clone()
    }

    fn contains(&self, dir: StoreDir, id: &str) -> bool {
        self.raw(dir, id).is_some()
    }
}
