//! Core key-value store trait and types.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Store backend errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Could not reach the backend.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The backend rejected or failed a command.
    #[error("Command error: {0}")]
    Command(String),

    /// Backend not available.
    #[error("Backend not available: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Lazily produced sequence of keys.
pub type KeyStream = BoxStream<'static, StoreResult<String>>;

/// Which backend a store handle is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map (single process, lost on restart).
    Memory,
    /// External Redis server.
    Redis,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redis => write!(f, "redis"),
        }
    }
}

/// Trait for key-value backends: plain string keys plus hash fields.
///
/// Implementations report failures; callers that want best-effort
/// semantics go through [`crate::StoreHandle`].
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Backend name (e.g., "memory", "redis")
    fn name(&self) -> &str;

    /// Read a string value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a string value, replacing whatever the key held.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Delete a key of any type.
    ///
    /// Returns true if the key existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Check whether a key exists.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Enumerate keys starting with `prefix`.
    ///
    /// The stream is lazy: backends fetch keys in batches as it is polled.
    fn scan_keys(&self, prefix: &str) -> KeyStream;

    /// Read one field of a hash.
    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Write one field of a hash.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// Remove one field of a hash.
    ///
    /// Returns true if the field existed.
    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// Read every field of a hash (empty when the key is absent).
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Round-trip to the backend.
    async fn ping(&self) -> StoreResult<()>;
}
