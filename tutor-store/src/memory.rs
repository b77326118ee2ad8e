//! In-process key-value store.
//!
//! Used when no Redis URL is configured or the startup probe fails. Data
//! lives for the lifetime of the process only.

use crate::traits::{KeyStream, KvStore, StoreResult};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryState {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// In-memory store.
///
/// One lock guards both maps, so every operation is atomic with respect to
/// every other operation on the store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let state = self.state.read().await;
        Ok(state.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.hashes.remove(key);
        state.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let had_string = state.strings.remove(key).is_some();
        let had_hash = state.hashes.remove(key).is_some();
        Ok(had_string || had_hash)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let state = self.state.read().await;
        Ok(state.strings.contains_key(key) || state.hashes.contains_key(key))
    }

    fn scan_keys(&self, prefix: &str) -> KeyStream {
        let state = Arc::clone(&self.state);
        let prefix = prefix.to_string();

        // Snapshot under the read lock; writers are not blocked while the
        // caller works through the keys.
        stream::once(async move {
            let state = state.read().await;
            state
                .strings
                .keys()
                .chain(state.hashes.keys())
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect::<Vec<_>>()
        })
        .flat_map(|keys| stream::iter(keys.into_iter().map(Ok)))
        .boxed()
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let state = self.state.read().await;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.strings.remove(key);
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(false);
        };
        let removed = hash.remove(field).is_some();
        // Redis drops a hash once its last field is gone
        if hash.is_empty() {
            state.hashes.remove(key);
        }
        Ok(removed)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let state = self.state.read().await;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_string_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "v1").await.unwrap();
        store.set("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
        assert!(store.exists("k").await.unwrap());

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_keys_filters_by_prefix() {
        let store = MemoryStore::new();
        store.set("chat_session:a", "1").await.unwrap();
        store.set("chat_session:b", "2").await.unwrap();
        store.set("current_prompt", "p").await.unwrap();
        store.hash_set("prompts", "x", "y").await.unwrap();

        let mut keys: Vec<String> = store
            .scan_keys("chat_session:")
            .map(|k| k.unwrap())
            .collect()
            .await;
        keys.sort();
        assert_eq!(keys, vec!["chat_session:a", "chat_session:b"]);
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let store = MemoryStore::new();
        store.hash_set("prompts", "socratic", "Ask questions").await.unwrap();
        store.hash_set("prompts", "strict", "No hints").await.unwrap();

        assert_eq!(
            store.hash_get("prompts", "strict").await.unwrap().as_deref(),
            Some("No hints")
        );
        assert_eq!(store.hash_get_all("prompts").await.unwrap().len(), 2);

        assert!(store.hash_delete("prompts", "strict").await.unwrap());
        assert!(!store.hash_delete("prompts", "strict").await.unwrap());
        assert!(store.hash_delete("prompts", "socratic").await.unwrap());

        // Empty hash disappears entirely
        assert!(!store.exists("prompts").await.unwrap());
        assert!(store.hash_get_all("prompts").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_replaces_hash() {
        let store = MemoryStore::new();
        store.hash_set("k", "f", "v").await.unwrap();
        store.set("k", "plain").await.unwrap();

        assert!(store.hash_get_all("k").await.unwrap().is_empty());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("plain"));
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let store = MemoryStore::new();
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.set(&format!("key:{i}"), "v").await.unwrap();
                store.hash_set("shared", &format!("f{i}"), "v").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.hash_get_all("shared").await.unwrap().len(), 32);
        let keys: Vec<_> = store.scan_keys("key:").collect().await;
        assert_eq!(keys.len(), 32);
    }
}
