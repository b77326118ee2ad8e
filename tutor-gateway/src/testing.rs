//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tutor_store::{KeyStream, KvStore, MemoryStore, StoreBackend, StoreError, StoreHandle, StoreResult};

/// Memory store that fails every call while `down` is set, like Redis
/// during a timeout.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("timed out".into()));
        }
        Ok(())
    }
}

/// A flaky store and a handle over it.
pub fn flaky_handle() -> (Arc<FlakyStore>, StoreHandle) {
    let store = Arc::new(FlakyStore::default());
    let handle = StoreHandle::new(StoreBackend::Redis, store.clone());
    (store, handle)
}

#[async_trait]
impl KvStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.exists(key).await
    }

    fn scan_keys(&self, prefix: &str) -> KeyStream {
        self.inner.scan_keys(prefix)
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.check()?;
        self.inner.hash_get(key, field).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.hash_set(key, field, value).await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.hash_delete(key, field).await
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.check()?;
        self.inner.hash_get_all(key).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }
}
