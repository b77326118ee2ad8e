//! Session lifecycle over the shared store.

use super::locks::SessionLocks;
use super::record::SessionRecord;
use crate::prompt::PromptStore;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::StreamExt;
use std::sync::{Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tutor_common::config::SessionConfig;
use tutor_store::StoreHandle;

/// Key prefix of every stored session.
pub const SESSION_KEY_PREFIX: &str = "chat_session:";

/// Upper bound for configured durations (100 years).
const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Store key for a session id.
pub fn session_key(session_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{session_id}")
}

fn seconds(secs: u64) -> TimeDelta {
    TimeDelta::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// Creates, loads, extends and expires chat sessions.
pub struct SessionManager {
    store: StoreHandle,
    ttl: TimeDelta,
    sweep_interval: TimeDelta,
    last_sweep: Mutex<Option<DateTime<Utc>>>,
    locks: SessionLocks,
}

impl SessionManager {
    pub fn new(store: StoreHandle, config: &SessionConfig) -> Self {
        Self {
            store,
            ttl: seconds(config.ttl_secs),
            sweep_interval: seconds(config.sweep_interval_secs),
            last_sweep: Mutex::new(None),
            locks: SessionLocks::new(),
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Exclusive use of one session until the guard is dropped.
    ///
    /// Hold it across `get_or_create` and `append_exchange` so concurrent
    /// requests for the same session do not lose each other's turns.
    pub async fn lock(&self, session_id: &str) -> OwnedMutexGuard<()> {
        self.locks.acquire(session_id).await
    }

    /// Load the session, or seed a new one from the current prompt and
    /// subject when none is stored.
    ///
    /// A stored value that cannot be decoded is replaced by a fresh seeded
    /// record. When the store cannot be read at all, a seeded record is
    /// returned detached so it never overwrites the history the store may
    /// still hold. On a hit, `last_accessed` is updated in the returned
    /// copy; it is persisted by the next `save` or `append_exchange`.
    pub async fn get_or_create(&self, session_id: &str, prompts: &PromptStore) -> SessionRecord {
        let key = session_key(session_id);

        match self.store.try_get(&key).await {
            Ok(Some(raw)) => match SessionRecord::decode(session_id, &raw) {
                Ok(mut record) => {
                    record.touch(Utc::now());
                    tracing::debug!(
                        session_id = %session_id,
                        turns = record.history().len(),
                        "Loaded chat session"
                    );
                    return record;
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Stored session is unreadable, starting it over"
                    );
                }
            },
            Ok(None) => {}
            Err(e) => {
                let seed = prompts.snapshot().await;
                let mut record = SessionRecord::new(session_id, &seed.prompt, &seed.subject, Utc::now());
                record.detach();
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    "Session store unreadable, answering from a detached session"
                );
                return record;
            }
        }

        let seed = prompts.snapshot().await;
        let record = SessionRecord::new(session_id, &seed.prompt, &seed.subject, Utc::now());
        self.save(&record).await;

        tracing::info!(
            session_id = %session_id,
            subject = %seed.subject,
            backend = %self.store.backend(),
            "Created chat session"
        );
        record
    }

    /// Append one completed exchange and persist the record.
    ///
    /// Returns whether the store accepted the write. The in-process copy is
    /// updated either way.
    pub async fn append_exchange(
        &self,
        record: &mut SessionRecord,
        user_message: &str,
        model_reply: &str,
    ) -> bool {
        record.push_exchange(user_message, model_reply, Utc::now());
        self.save(record).await
    }

    /// Overwrite the stored copy of `record`. Detached records are not
    /// written.
    pub async fn save(&self, record: &SessionRecord) -> bool {
        if record.is_detached() {
            tracing::debug!(session_id = %record.session_id(), "Not saving detached session");
            return false;
        }
        let raw = match record.encode() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(session_id = %record.session_id(), error = %e, "Failed to encode session");
                return false;
            }
        };
        self.store.set(&session_key(record.session_id()), &raw).await
    }

    /// Read a session without creating or touching it.
    pub async fn load(&self, session_id: &str) -> Option<SessionRecord> {
        let raw = self.store.get(&session_key(session_id)).await?;
        SessionRecord::decode(session_id, &raw).ok()
    }

    /// Delete every session idle for longer than the TTL as of `now`.
    ///
    /// Returns the number of sessions removed. Values that cannot be read
    /// are left alone, as are sessions held by an in-flight exchange.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut keys = self.store.scan_keys(SESSION_KEY_PREFIX);
        let mut scanned = 0usize;
        let mut removed = 0usize;

        while let Some(key) = keys.next().await {
            scanned += 1;
            let session_id = key.strip_prefix(SESSION_KEY_PREFIX).unwrap_or(&key);
            let Some(_guard) = self.locks.try_acquire(session_id) else {
                tracing::debug!(key = %key, "Session busy, skipping during sweep");
                continue;
            };
            let Some(raw) = self.store.get(&key).await else {
                continue;
            };

            match SessionRecord::decode_last_accessed(&raw) {
                Ok(last_accessed) if now - last_accessed > self.ttl => {
                    if self.store.delete(&key).await {
                        removed += 1;
                        tracing::debug!(key = %key, last_accessed = %last_accessed, "Expired chat session");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable session during sweep");
                }
            }
        }

        let pruned = self.locks.prune();
        tracing::info!(scanned, removed, pruned_locks = pruned, "Session sweep finished");
        removed
    }

    /// Run `sweep_expired` unless one ran within the sweep interval.
    ///
    /// Returns `None` when the sweep was skipped.
    pub async fn maybe_sweep(&self, now: DateTime<Utc>) -> Option<usize> {
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = *last {
                if now - previous < self.sweep_interval {
                    return None;
                }
            }
            *last = Some(now);
        }

        Some(self.sweep_expired(now).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::PromptStore;
    use crate::session::{Role, Turn};
    use crate::testing::flaky_handle;
    use std::sync::Arc;
    use tutor_common::config::{FrontendConfig, PromptConfig};

    fn prompts_with(store: &StoreHandle, dir: &tempfile::TempDir) -> PromptStore {
        let config = PromptConfig {
            default_prompt: "Teach Java".to_string(),
            default_subject: "Java".to_string(),
            defaults_file: dir.path().join("prompt_defaults.json"),
        };
        PromptStore::new(store.clone(), &config, &FrontendConfig::default())
    }

    fn manager(store: &StoreHandle) -> SessionManager {
        SessionManager::new(store.clone(), &SessionConfig::default())
    }

    #[tokio::test]
    async fn test_new_session_is_seeded_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreHandle::memory();
        let prompts = prompts_with(&store, &dir);
        let sessions = manager(&store);

        let record = sessions.get_or_create("abc", &prompts).await;

        assert_eq!(record.history()[0], Turn::user("Teach Java"));
        assert_eq!(record.history()[1].role, Role::Model);
        assert!(store.exists("chat_session:abc").await);
    }

    #[tokio::test]
    async fn test_existing_session_is_not_reseeded() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreHandle::memory();
        let prompts = prompts_with(&store, &dir);
        let sessions = manager(&store);

        let mut record = sessions.get_or_create("abc", &prompts).await;
        sessions.append_exchange(&mut record, "hi", "hello").await;

        // A prompt change only affects sessions created afterwards
        prompts.set_prompt("Teach Rust", false).await.unwrap();

        let reloaded = sessions.get_or_create("abc", &prompts).await;
        assert_eq!(reloaded.history().len(), 4);
        assert_eq!(reloaded.history()[0].text(), "Teach Java");
        assert_eq!(reloaded.history()[3].text(), "hello");

        let fresh = sessions.get_or_create("other", &prompts).await;
        assert_eq!(fresh.history()[0].text(), "Teach Rust");
    }

    #[tokio::test]
    async fn test_corrupt_session_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreHandle::memory();
        let prompts = prompts_with(&store, &dir);
        let sessions = manager(&store);

        store.set("chat_session:bad", "{not json").await;
        let record = sessions.get_or_create("bad", &prompts).await;

        assert_eq!(record.history().len(), 2);
        let stored = sessions.load("bad").await.unwrap();
        assert_eq!(stored.history().len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreHandle::memory();
        let prompts = prompts_with(&store, &dir);
        let sessions = manager(&store);
        let now = Utc::now();

        let mut stale = sessions.get_or_create("stale", &prompts).await;
        stale.touch(now - TimeDelta::hours(25));
        sessions.save(&stale).await;

        let mut recent = sessions.get_or_create("recent", &prompts).await;
        recent.touch(now - TimeDelta::hours(1));
        sessions.save(&recent).await;

        store.set("chat_session:junk", "garbage").await;
        store.set("current_prompt", "untouched").await;

        assert_eq!(sessions.sweep_expired(now).await, 1);
        assert!(!store.exists("chat_session:stale").await);
        assert!(store.exists("chat_session:recent").await);
        assert!(store.exists("chat_session:junk").await);
        assert!(store.exists("current_prompt").await);
    }

    #[tokio::test]
    async fn test_failed_read_keeps_stored_history() {
        let dir = tempfile::tempdir().unwrap();
        let (flaky, store) = flaky_handle();
        let prompts = prompts_with(&store, &dir);
        let sessions = manager(&store);

        let mut record = sessions.get_or_create("abc", &prompts).await;
        for i in 0..3 {
            sessions
                .append_exchange(&mut record, &format!("q{i}"), &format!("a{i}"))
                .await;
        }
        assert_eq!(sessions.load("abc").await.unwrap().history().len(), 8);

        flaky.set_down(true);
        let mut during_outage = sessions.get_or_create("abc", &prompts).await;
        assert_eq!(during_outage.history().len(), 2);
        assert!(during_outage.is_detached());

        // The store comes back before the exchange is recorded
        flaky.set_down(false);
        assert!(!sessions.append_exchange(&mut during_outage, "q", "a").await);

        let stored = sessions.load("abc").await.unwrap();
        assert_eq!(stored.history().len(), 8);
        assert_eq!(stored.history()[7].text(), "a2");
    }

    #[tokio::test]
    async fn test_sweep_skips_session_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreHandle::memory();
        let prompts = prompts_with(&store, &dir);
        let sessions = manager(&store);
        let now = Utc::now();

        let mut stale = sessions.get_or_create("busy", &prompts).await;
        stale.touch(now - TimeDelta::hours(25));
        sessions.save(&stale).await;

        let guard = sessions.lock("busy").await;
        assert_eq!(sessions.sweep_expired(now).await, 0);
        assert!(store.exists("chat_session:busy").await);

        drop(guard);
        assert_eq!(sessions.sweep_expired(now).await, 1);
        assert!(!store.exists("chat_session:busy").await);
    }

    #[tokio::test]
    async fn test_maybe_sweep_is_throttled() {
        let store = StoreHandle::memory();
        let sessions = SessionManager::new(
            store,
            &SessionConfig {
                ttl_secs: 60,
                sweep_interval_secs: 300,
            },
        );
        let now = Utc::now();

        assert_eq!(sessions.maybe_sweep(now).await, Some(0));
        assert_eq!(sessions.maybe_sweep(now + TimeDelta::seconds(10)).await, None);
        assert_eq!(sessions.maybe_sweep(now + TimeDelta::seconds(301)).await, Some(0));
    }

    #[tokio::test]
    async fn test_locked_concurrent_appends_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreHandle::memory();
        let prompts = Arc::new(prompts_with(&store, &dir));
        let sessions = Arc::new(manager(&store));

        let mut tasks = Vec::new();
        for i in 0..2 {
            let sessions = Arc::clone(&sessions);
            let prompts = Arc::clone(&prompts);
            tasks.push(tokio::spawn(async move {
                let _guard = sessions.lock("shared").await;
                let mut record = sessions.get_or_create("shared", &prompts).await;
                tokio::task::yield_now().await;
                sessions
                    .append_exchange(&mut record, &format!("q{i}"), &format!("a{i}"))
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let record = sessions.load("shared").await.unwrap();
        assert_eq!(record.history().len(), 6);
    }
}
