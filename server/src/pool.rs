use std::sync::Arc;
use tokio::sync::{
    OwnedSemaphorePermit,
    Semaphore,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("all {0} workers are busy")]
pub struct Saturated(pub usize);

/// Fixed number of connection slots. Admission never waits: a connection either
/// gets a slot right away or is turned away.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

/// Held for as long as a connection is served. Dropping it frees the slot.
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn try_acquire(&self) -> Result<WorkerSlot, Saturated> {
        self.slots
            .clone()
            .try_acquire_owned()
            .map(|permit| WorkerSlot { _permit: permit })
            .map_err(|_| Saturated(self.size))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}
