use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use log::{debug, error, info, warn};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use crate::config::PipelineConfig;
use crate::debounce::Debouncer;
use crate::error::{PipelineError, PipelineResult};
use crate::limiter::ConcurrencyLimiter;
use crate::processor::{EntryMode, JobOutcome, JobProcessor};
use crate::store::{is_record_path, DirJobStore, StoreDir};

/// Record files an event makes available in the watched directory.
///
/// Creations and rename targets count; removals, metadata changes and files without the
/// record extension do not.
pub fn arrived_records(event: &Event) -> Vec<PathBuf> {
    let candidates: Vec<&PathBuf> = match &event.kind {
        EventKind::Create(_) => event.paths.iter().collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.iter().collect(),
        // [from, to]
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event.paths.last().into_iter().collect(),
        _ => Vec::new(),
    };
    candidates
        .into_iter()
        .filter(|p| is_record_path(p))
        .cloned()
        .collect()
}

/// Paths that have been admitted and whose job has not finished yet
#[derive(Debug, Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<PathBuf>>>);

impl InFlight {
    /// `None` when the path is already admitted
    fn claim(&self, path: &Path) -> Option<Claim> {
        if !self.lock().insert(path.to_path_buf()) {
            return None;
        }
        Some(Claim {
            paths: self.clone(),
            path: path.to_path_buf(),
        })
    }

    fn contains(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the path when dropped, whether the job finished or was never started
struct Claim {
    paths: InFlight,
    path: PathBuf,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.paths.lock().remove(&self.path);
    }
}

/// Background entry mode: watches `new`, debounces arrivals and runs admitted jobs
/// under the concurrency limit.
pub struct JobWatcher {
    store: Arc<DirJobStore>,
    processor: Arc<JobProcessor>,
    limiter: ConcurrencyLimiter,
    debouncer: Debouncer,
    in_flight: InFlight,
    settle_delay: Duration,
}

impl JobWatcher {
    pub fn new(store: Arc<DirJobStore>, processor: Arc<JobProcessor>, cfg: &PipelineConfig) -> Self {
        Self {
            store,
            processor,
            limiter: ConcurrencyLimiter::new(cfg.max_concurrent_jobs),
            debouncer: Debouncer::new(cfg.debounce()),
            in_flight: InFlight::default(),
            settle_delay: cfg.settle_delay(),
        }
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Whether a job for `path` is waiting for a slot or running
    pub fn is_in_flight(&self, path: &Path) -> bool {
        self.in_flight.contains(path)
    }

    /// Watch until the event stream ends. Failing to watch the directory is fatal.
    pub async fn run(&self) -> PipelineResult<()> {
        let new_dir = self.store.dir(StoreDir::New);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // receiver gone means the loop below has already returned
            let _ = tx.send(res);
        })
        .map_err(|e| PipelineError::io(&new_dir, std::io::Error::other(e)))?;
        watcher
            .watch(&new_dir, RecursiveMode::NonRecursive)
            .map_err(|e| PipelineError::io(&new_dir, std::io::Error::other(e)))?;
        info!("👀 Watching {} for new job records", new_dir.display());

        self.readmit_pending();

        while let Some(res) = rx.recv().await {
            match res {
                Ok(event) => {
                    for path in arrived_records(&event) {
                        debug!("Event {:?} on {}", event.kind, path.display());
                        self.admit(path);
                    }
                }
                Err(e) => {
                    if !new_dir.is_dir() {
                        error!("Lost watched directory {}: {}", new_dir.display(), e);
                        return Err(PipelineError::io(&new_dir, std::io::Error::other(e)));
                    }
                    warn!("Watcher error: {}", e);
                }
            }
        }

        info!("Watcher event stream closed");
        Ok(())
    }

    /// Records left in `new` by an earlier run go through the same path as fresh arrivals
    fn readmit_pending(&self) {
        match self.store.pending() {
            Ok(paths) if paths.is_empty() => {}
            Ok(paths) => {
                info!("🔄 Re-admitting {} record(s) already waiting in new", paths.len());
                for path in paths {
                    self.admit(path);
                }
            }
            Err(e) => warn!("Could not list pending records: {}", e),
        }
    }

    fn admit(&self, path: PathBuf) {
        let limiter = self.limiter.clone();
        let processor = self.processor.clone();
        let in_flight = self.in_flight.clone();
        let settle_delay = self.settle_delay;

        self.debouncer.schedule(path, move |path| async move {
            // a record announced again while its job is pending or running is the same job
            let Some(claim) = in_flight.claim(&path) else {
                debug!("{} is already admitted, ignoring repeat event", path.display());
                return;
            };
            let Some(permit) = limiter.acquire().await else {
                warn!("Not admitting {}: watcher is shutting down", path.display());
                return;
            };
            tokio::spawn(async move {
                // slot and claim are released when the job finishes, whatever the outcome
                let _permit = permit;
                let _claim = claim;
                tokio::time::sleep(settle_delay).await;
                let outcome = processor.process(&path, &EntryMode::Service).await;
                log_outcome(&path, &outcome);
            });
        });
    }
}

fn log_outcome(path: &Path, outcome: &JobOutcome) {
    match outcome {
        JobOutcome::Succeeded { id, .. } => info!("Job {}: finished", id),
        JobOutcome::Failed { id, stage, message } => warn!("Job {}: failed during {}: {}", id, stage, message),
        JobOutcome::Abandoned { reason, .. } => info!("Skipped {}: {}", path.display(), reason),
    }
}
