use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use log::debug;
use tokio::task::JoinHandle;

struct Pending {
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    pending: HashMap<PathBuf, Pending>,
    next_generation: u64,
}

/// Coalesces bursts of events per path into one firing after a quiet period.
///
/// Each path is Idle (untracked) or Pending with one timer task. Scheduling a Pending
/// path cancels its timer and starts a new one. When a timer survives the quiet period
/// it removes its own entry and runs the callback.
#[derive(Clone)]
pub struct Debouncer {
    quiet: Duration,
    timers: Arc<Mutex<Timers>>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            timers: Arc::new(Mutex::new(Timers::default())),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet
    }

    /// Start or restart the quiet period for `path`; `fire` runs once it elapses
    pub fn schedule<F, Fut>(&self, path: PathBuf, fire: F)
    where
        F: FnOnce(PathBuf) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut timers = lock(&self.timers);
        timers.next_generation += 1;
        let generation = timers.next_generation;

        let shared = self.timers.clone();
        let quiet = self.quiet;
        let key = path.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            {
                let mut timers = lock(&shared);
                // a newer event may have replaced this timer after it woke
                match timers.pending.get(&key) {
                    Some(p) if p.generation == generation => {
                        timers.pending.remove(&key);
                    }
                    _ => return,
                }
            }
            debug!("Quiet period elapsed for {}", key.display());
            fire(key).await;
        });

        if let Some(previous) = timers.pending.insert(path, Pending { generation, timer }) {
            previous.timer.abort();
        }
    }

    /// Paths currently waiting out their quiet period
    pub fn pending_count(&self) -> usize {
        lock(&self.timers).pending.len()
    }
}

fn lock(timers: &Mutex<Timers>) -> MutexGuard<'_, Timers> {
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<Mutex<Vec<PathBuf>>>, impl Fn() -> Vec<PathBuf>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let view = fired.clone();
        (fired, move || view.lock().unwrap().clone())
    }

    #[tokio::test]
    async fn test_burst_on_one_path_fires_once() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let (fired, seen) = counter();

        for _ in 0..5 {
            let sink = fired.clone();
            debouncer.schedule(PathBuf::from("new/abc.json"), move |p| async move {
                sink.lock().unwrap().push(p);
            });
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(debouncer.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(seen(), vec![PathBuf::from("new/abc.json")]);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_distinct_paths_fire_independently() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        let count = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let count = count.clone();
            debouncer.schedule(PathBuf::from(format!("new/{}.json", i)), move |_| async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_event_after_firing_starts_a_new_period() {
        let debouncer = Debouncer::new(Duration::from_millis(30));
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let count = count.clone();
            debouncer.schedule(PathBuf::from("new/abc.json"), move |_| async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
