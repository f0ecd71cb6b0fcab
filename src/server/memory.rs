//! Admission control for in-flight request memory.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting semaphore of bytes bounding in-flight request memory for one
/// shard.
///
/// Waiters are served FIFO. There is no deadlock avoidance: a handler must
/// reserve in one shot for any request sized near the total budget,
/// otherwise an unsatisfiable reservation can wait forever behind
/// already-admitted requests.
pub struct MemoryPool {
    sem: Arc<Semaphore>,
    capacity: usize,
    waiters: AtomicUsize,
}

impl MemoryPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(Semaphore::MAX_PERMITS);
        Self {
            sem: Arc::new(Semaphore::new(capacity)),
            capacity,
            waiters: AtomicUsize::new(0),
        }
    }

    /// Configured byte budget.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently available for reservation.
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Bytes currently reserved by in-flight requests.
    pub fn consumed(&self) -> usize {
        self.capacity - self.available()
    }

    /// Number of reservations currently suspended waiting for units.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Reserves `bytes` units without waiting, or returns `None` when not
    /// enough are available at the instant of the attempt.
    pub fn try_acquire(&self, bytes: u32) -> Option<MemoryUnits> {
        Arc::clone(&self.sem)
            .try_acquire_many_owned(bytes)
            .ok()
            .map(|permit| MemoryUnits {
                bytes,
                _permit: permit,
            })
    }

    /// Reserves `bytes` units, suspending until they become available.
    pub async fn acquire(&self, bytes: u32) -> MemoryUnits {
        if let Some(units) = self.try_acquire(bytes) {
            return units;
        }
        self.waiters.fetch_add(1, Ordering::Relaxed);
        let _waiting = Waiting(&self.waiters);
        let permit = Arc::clone(&self.sem)
            .acquire_many_owned(bytes)
            .await
            .expect("memory pool semaphore never closes");
        MemoryUnits {
            bytes,
            _permit: permit,
        }
    }
}

/// Scoped claim on reserved bytes.
///
/// Dropping the claim returns its units to the pool on every exit path;
/// this is the single mechanism keeping the semaphore balanced.
pub struct MemoryUnits {
    bytes: u32,
    _permit: OwnedSemaphorePermit,
}

impl MemoryUnits {
    /// Number of bytes this claim holds.
    pub fn bytes(&self) -> u32 {
        self.bytes
    }
}

/// Keeps the waiter gauge balanced even if the acquiring future is
/// dropped mid wait.
struct Waiting<'a>(&'a AtomicUsize);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
