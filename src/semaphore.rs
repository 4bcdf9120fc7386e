//! Named in-process locks with backoff, RAII guards and statistics
//!
//! One [`Semaphore`] is shared (cheaply cloned) by every caller that must not
//! interleave work on the same resource, e.g. `command_<consumer>`.

use crate::error::{SydpowerError, SydpowerResult};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Default acquisition budget
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct LockRecord {
    /// Distinguishes successive holders of the same resource
    id: u64,
    acquired_at: Instant,
    attempts: u32,
}

#[derive(Debug, Default)]
struct SemaphoreState {
    held: HashMap<String, LockRecord>,
    next_id: u64,
    acquired: u64,
    released: u64,
    timeouts: u64,
    conflicts: u64,
}

/// One currently held lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveLock {
    pub resource: String,
    pub held_ms: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SemaphoreStats {
    pub acquired: u64,
    pub released: u64,
    pub timeouts: u64,
    pub conflicts: u64,
    pub active: usize,
    pub active_details: Vec<ActiveLock>,
}

#[derive(Debug, Clone, Default)]
pub struct Semaphore {
    state: Arc<Mutex<SemaphoreState>>,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SemaphoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_take(&self, resource: &str, attempts: u32) -> Option<u64> {
        let mut state = self.state();
        if state.held.contains_key(resource) {
            return None;
        }
        state.next_id += 1;
        let id = state.next_id;
        state.held.insert(
            resource.to_string(),
            LockRecord {
                id,
                acquired_at: Instant::now(),
                attempts,
            },
        );
        state.acquired += 1;
        Some(id)
    }

    /// Acquire `resource`, retrying with exponential backoff until `timeout`
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> bool {
        self.acquire_id(resource, timeout).await.is_some()
    }

    async fn acquire_id(&self, resource: &str, timeout: Duration) -> Option<u64> {
        let start = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(id) = self.try_take(resource, attempts) {
                let waited = start.elapsed();
                if waited > Duration::from_millis(100) {
                    info!(resource, waited_ms = waited.as_millis() as u64, attempts, "Lock acquired after waiting");
                }
                return Some(id);
            }

            if attempts == 1 {
                self.state().conflicts += 1;
                debug!(resource, "Lock is held, waiting");
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                break;
            }
            tokio::time::sleep(backoff.min(timeout - elapsed)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        self.state().timeouts += 1;
        warn!(
            resource,
            waited_ms = start.elapsed().as_millis() as u64,
            attempts,
            "Lock acquisition timed out"
        );
        None
    }

    /// Single non-blocking attempt
    pub fn try_acquire(&self, resource: &str) -> bool {
        if self.try_take(resource, 1).is_some() {
            return true;
        }
        self.state().conflicts += 1;
        false
    }

    /// Release `resource`. Releasing a lock that is not held is a logged no-op.
    pub fn release(&self, resource: &str) -> bool {
        let mut state = self.state();
        let Some(record) = state.held.remove(resource) else {
            warn!(resource, "Release of a lock that is not held");
            return false;
        };
        state.released += 1;
        drop(state);
        Self::log_release(resource, &record);
        true
    }

    /// Release `resource` only if it is still held by acquisition `id`.
    ///
    /// A hold that was force-released and taken by someone else is left alone.
    fn release_if_owner(&self, resource: &str, id: u64) -> bool {
        let mut state = self.state();
        match state.held.get(resource) {
            Some(record) if record.id == id => {}
            _ => {
                debug!(resource, "Lock no longer owned by this guard, not releasing");
                return false;
            }
        }
        let Some(record) = state.held.remove(resource) else {
            return false;
        };
        state.released += 1;
        drop(state);
        Self::log_release(resource, &record);
        true
    }

    fn log_release(resource: &str, record: &LockRecord) {
        let held = record.acquired_at.elapsed();
        if held > Duration::from_secs(1) {
            warn!(resource, held_ms = held.as_millis() as u64, "Lock was held for a long time");
        } else {
            debug!(resource, held_ms = held.as_millis() as u64, "Lock released");
        }
    }

    /// Acquire and wrap the hold in a guard that releases on drop
    pub async fn guard(&self, resource: &str, timeout: Duration) -> Option<SemaphoreGuard> {
        self.acquire_id(resource, timeout)
            .await
            .map(|id| SemaphoreGuard {
                semaphore: self.clone(),
                resource: resource.to_string(),
                id,
            })
    }

    /// Run `f` while holding `resource`.
    ///
    /// The lock is released on every exit path, including a panic inside `f`
    /// or the future being dropped.
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource: &str,
        timeout: Duration,
        f: F,
    ) -> SydpowerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SydpowerResult<T>>,
    {
        let _guard = self
            .guard(resource, timeout)
            .await
            .ok_or_else(|| SydpowerError::lock_timeout(resource, timeout.as_millis() as u64))?;

        let result = f().await;
        if let Err(e) = &result {
            warn!(resource, error = %e.sanitized_message(), "Error in locked section");
        }
        result
    }

    pub fn is_locked(&self, resource: &str) -> bool {
        self.state().held.contains_key(resource)
    }

    /// Force-release locks held longer than `max_age`
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let mut state = self.state();
        let stale: Vec<String> = state
            .held
            .iter()
            .filter(|(_, record)| record.acquired_at.elapsed() > max_age)
            .map(|(resource, _)| resource.clone())
            .collect();

        for resource in &stale {
            state.held.remove(resource);
            state.released += 1;
            warn!(resource = %resource, "Force-released stale lock");
        }
        stale.len()
    }

    pub fn release_all(&self) {
        let mut state = self.state();
        let count = state.held.len();
        if count > 0 {
            info!(count, "Releasing all locks");
        }
        state.released += count as u64;
        state.held.clear();
    }

    pub fn stats(&self) -> SemaphoreStats {
        let state = self.state();
        let mut active_details: Vec<ActiveLock> = state
            .held
            .iter()
            .map(|(resource, record)| ActiveLock {
                resource: resource.clone(),
                held_ms: record.acquired_at.elapsed().as_millis() as u64,
                attempts: record.attempts,
            })
            .collect();
        active_details.sort_by(|a, b| a.resource.cmp(&b.resource));

        SemaphoreStats {
            acquired: state.acquired,
            released: state.released,
            timeouts: state.timeouts,
            conflicts: state.conflicts,
            active: state.held.len(),
            active_details,
        }
    }

    pub fn reset_stats(&self) {
        let mut state = self.state();
        state.acquired = 0;
        state.released = 0;
        state.timeouts = 0;
        state.conflicts = 0;
    }
}

/// Held lock; released when dropped
#[derive(Debug)]
pub struct SemaphoreGuard {
    semaphore: Semaphore,
    resource: String,
    id: u64,
}

impl SemaphoreGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        self.semaphore.release_if_owner(&self.resource, self.id);
    }
}
