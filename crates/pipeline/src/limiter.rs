use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Capacity-bounded admission gate for watcher-admitted jobs.
///
/// A slot is held for as long as the returned permit lives; dropping it is the release.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a free slot. `None` only once the limiter has been closed.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().acquire_owned().await.ok()
    }

    /// Stop admitting; waiters and later callers get `None`
    pub fn close(&self) {
        self.slots.close();
    }
}
