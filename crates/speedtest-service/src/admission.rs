//! Process-wide cap on simultaneously in-flight requests.
//!
//! Independent of client identity. Acquisition never waits: when every slot
//! is taken the caller is told to come back later. A slot is an RAII permit,
//! so it goes back to the pool on every exit path, including panics and
//! client disconnects.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Suggested client back-off after a capacity rejection, in seconds.
pub const RETRY_AFTER_SECS: u64 = 1;

/// Fixed-capacity slot pool. `capacity = 0` disables the gate.
#[derive(Clone)]
pub struct AdmissionGate {
    semaphore: Option<Arc<Semaphore>>,
    capacity: usize,
}

/// One occupied slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl AdmissionPermit {
    /// Returns the slot to the pool. Equivalent to dropping the permit.
    pub fn release(self) {}
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        let semaphore = (capacity > 0).then(|| Arc::new(Semaphore::new(capacity)));
        Self {
            semaphore,
            capacity,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.semaphore.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Takes a slot if one is free. Returns `None` when the gate is full.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        match &self.semaphore {
            None => Some(AdmissionPermit { _permit: None }),
            Some(semaphore) => Arc::clone(semaphore)
                .try_acquire_owned()
                .ok()
                .map(|permit| AdmissionPermit {
                    _permit: Some(permit),
                }),
        }
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.semaphore
            .as_ref()
            .map_or(0, |s| self.capacity - s.available_permits())
    }
}
