//! Per-session exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

/// Table of async mutexes keyed by session id.
///
/// Holding the guard for a session serializes its read-modify-write cycle;
/// different sessions never contend.
#[derive(Debug, Default)]
pub struct SessionLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `session_id`.
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(table.entry(session_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Take `session_id` only if nobody holds it right now.
    pub fn try_acquire(&self, session_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(table.entry(session_id.to_string()).or_default())
        };
        lock.try_lock_owned().ok()
    }

    /// Drop entries nobody holds or waits on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = table.len();
        // Holders and waiters all own a clone, taken under this same lock
        table.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - table.len()
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
