//! Best-effort façade over a [`KvStore`].
//!
//! Every failure is logged with the key and operation and turned into
//! "absent" or "no-op". Nothing is retried. The `try_` variants log the
//! same way but hand the error back, for callers that must not mistake a
//! failed read for a missing key.

use crate::memory::MemoryStore;
use crate::traits::{KvStore, StoreBackend, StoreResult};
use futures_util::future;
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;

/// Shared handle to the backend selected at startup.
#[derive(Clone)]
pub struct StoreHandle {
    backend: StoreBackend,
    inner: Arc<dyn KvStore>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("backend", &self.backend)
            .field("name", &self.inner.name())
            .finish()
    }
}

impl StoreHandle {
    /// Wrap an existing backend.
    pub fn new(backend: StoreBackend, inner: Arc<dyn KvStore>) -> Self {
        Self { backend, inner }
    }

    /// Handle over a fresh in-memory store.
    pub fn memory() -> Self {
        Self::new(StoreBackend::Memory, Arc::new(MemoryStore::new()))
    }

    /// Which backend was selected.
    pub fn backend(&self) -> StoreBackend {
        self.backend
    }

    /// Read a string value; `None` when absent or on failure.
    pub async fn get(&self, key: &str) -> Option<String> {
        match self.inner.get(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(backend = %self.backend, key = %key, operation = "get", error = %e, "Store read failed, treating as absent");
                None
            }
        }
    }

    /// Read a string value, keeping "absent" and "failed" apart.
    pub async fn try_get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await.inspect_err(|e| {
            tracing::warn!(backend = %self.backend, key = %key, operation = "get", error = %e, "Store read failed");
        })
    }

    /// Write a string value. Returns whether the write was applied.
    pub async fn set(&self, key: &str, value: &str) -> bool {
        match self.inner.set(key, value).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(backend = %self.backend, key = %key, operation = "set", error = %e, "Store write failed, dropping it");
                false
            }
        }
    }

    /// Delete a key. Returns whether a key was removed.
    pub async fn delete(&self, key: &str) -> bool {
        match self.inner.delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(backend = %self.backend, key = %key, operation = "delete", error = %e, "Store delete failed");
                false
            }
        }
    }

    /// Whether a key exists; `false` on failure.
    pub async fn exists(&self, key: &str) -> bool {
        match self.inner.exists(key).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(backend = %self.backend, key = %key, operation = "exists", error = %e, "Store exists check failed");
                false
            }
        }
    }

    /// Lazily enumerate keys with `prefix`. A failure ends the stream early.
    pub fn scan_keys(&self, prefix: &str) -> BoxStream<'static, String> {
        let backend = self.backend;
        let prefix_owned = prefix.to_string();

        self.inner
            .scan_keys(prefix)
            .scan((), move |_, item| {
                let next = match item {
                    Ok(key) => Some(key),
                    Err(e) => {
                        tracing::warn!(backend = %backend, prefix = %prefix_owned, operation = "scan", error = %e, "Store scan failed, stopping early");
                        None
                    }
                };
                future::ready(next)
            })
            .boxed()
    }

    /// Read one hash field.
    pub async fn hash_get(&self, key: &str, field: &str) -> Option<String> {
        match self.inner.hash_get(key, field).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(backend = %self.backend, key = %key, field = %field, operation = "hget", error = %e, "Store hash read failed, treating as absent");
                None
            }
        }
    }

    /// Write one hash field. Returns whether the write was applied.
    pub async fn hash_set(&self, key: &str, field: &str, value: &str) -> bool {
        match self.inner.hash_set(key, field, value).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(backend = %self.backend, key = %key, field = %field, operation = "hset", error = %e, "Store hash write failed, dropping it");
                false
            }
        }
    }

    /// Remove one hash field. Returns whether a field was removed.
    pub async fn hash_delete(&self, key: &str, field: &str) -> bool {
        match self.inner.hash_delete(key, field).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(backend = %self.backend, key = %key, field = %field, operation = "hdel", error = %e, "Store hash delete failed");
                false
            }
        }
    }

    /// Remove one hash field, reporting backend failures.
    pub async fn try_hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.inner.hash_delete(key, field).await.inspect_err(|e| {
            tracing::warn!(backend = %self.backend, key = %key, field = %field, operation = "hdel", error = %e, "Store hash delete failed");
        })
    }

    /// Read a whole hash; empty when absent or on failure.
    pub async fn hash_get_all(&self, key: &str) -> HashMap<String, String> {
        match self.inner.hash_get_all(key).await {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(backend = %self.backend, key = %key, operation = "hgetall", error = %e, "Store hash read failed, treating as empty");
                HashMap::new()
            }
        }
    }

    /// Whether the backend currently answers.
    pub async fn is_healthy(&self) -> bool {
        self.inner.ping().await.is_ok()
    }
}
