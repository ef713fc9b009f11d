//! Bounded per-participant concurrency.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps the number of in-flight calls to one participant.
///
/// Acquisition never waits: when all slots are taken the call fails fast
/// with `UNAVAILABLE`, keeping a slow participant from absorbing every
/// driver task.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    slots: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Creates a bulkhead with the given number of slots.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Tries to take a slot; `None` means the bulkhead is full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().try_acquire_owned().ok()
    }

    /// Returns the number of free slots.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Returns the configured slot count.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
