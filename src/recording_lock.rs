use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingLease {
    pub camera_id: String,
    pub acquired_at: DateTime<Utc>,
}

struct HeldLease {
    _permit: OwnedSemaphorePermit,
    acquired_at: DateTime<Utc>,
}

struct LeaseSlot {
    semaphore: Arc<Semaphore>,
    held: Mutex<Option<HeldLease>>,
}

/// Per-camera exclusivity gate for launching recording jobs.
///
/// Only guards job setup. Recording keeps running after the lease is released.
#[derive(Clone, Default)]
pub struct RecordingLock {
    slots: Arc<Mutex<HashMap<String, Arc<LeaseSlot>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordingLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, camera_id: &str) -> Arc<LeaseSlot> {
        lock(&self.slots)
            .entry(camera_id.to_string())
            .or_insert_with(|| {
                Arc::new(LeaseSlot {
                    semaphore: Arc::new(Semaphore::new(1)),
                    held: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Wait up to `timeout` for the camera's lease. `false` means "busy, retry later".
    pub async fn try_acquire(&self, camera_id: &str, timeout: Duration) -> bool {
        let slot = self.slot(camera_id);
        match tokio::time::timeout(timeout, slot.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                *lock(&slot.held) = Some(HeldLease { _permit: permit, acquired_at: Utc::now() });
                debug!("Recording lease acquired for camera '{}'", camera_id);
                true
            }
            Ok(Err(_)) => false,
            Err(_) => {
                debug!("Timed out after {:?} waiting for recording lease on camera '{}'", timeout, camera_id);
                false
            }
        }
    }

    /// Release the camera's lease. Releasing a lease that is not held is a no-op.
    pub fn release(&self, camera_id: &str) {
        let Some(slot) = lock(&self.slots).get(camera_id).cloned() else {
            return;
        };

        let released = lock(&slot.held).take();
        if let Some(lease) = released {
            let held_for = Utc::now().signed_duration_since(lease.acquired_at);
            debug!(
                "Recording lease released for camera '{}' after {} ms",
                camera_id,
                held_for.num_milliseconds()
            );
        }
    }

    /// Acquire and wrap the lease in a guard that releases it when dropped.
    pub async fn acquire_guard(&self, camera_id: &str, timeout: Duration) -> Option<LeaseGuard> {
        if self.try_acquire(camera_id, timeout).await {
            Some(LeaseGuard { lock: self.clone(), camera_id: camera_id.to_string() })
        } else {
            None
        }
    }

    pub fn lease(&self, camera_id: &str) -> Option<RecordingLease> {
        let slot = lock(&self.slots).get(camera_id).cloned()?;
        let held = lock(&slot.held);
        held.as_ref().map(|lease| RecordingLease {
            camera_id: camera_id.to_string(),
            acquired_at: lease.acquired_at,
        })
    }

    pub fn is_held(&self, camera_id: &str) -> bool {
        self.lease(camera_id).is_some()
    }
}

pub struct LeaseGuard {
    lock: RecordingLock,
    camera_id: String,
}

impl LeaseGuard {
    pub fn release(self) {
        // Drop does the work
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.lock.release(&self.camera_id);
    }
}
