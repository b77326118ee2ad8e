//! Redis-backed key-value store.

use crate::traits::{KeyStream, KvStore, StoreError, StoreResult};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use redis::aio::ConnectionManager;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Keys requested per `SCAN` round trip.
const SCAN_BATCH: usize = 100;

/// Redis store configuration.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis URL (redis://host:port).
    pub url: String,
    /// Bound on the connect and probe at construction.
    pub timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Redis store.
///
/// Holds a [`ConnectionManager`], which multiplexes commands over one
/// connection and reconnects on its own; each command clones the handle.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(config: &RedisStoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let conn = tokio::time::timeout(config.timeout, client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Connection(format!("connect timed out after {:?}", config.timeout)))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { conn };

        tokio::time::timeout(config.timeout, store.ping())
            .await
            .map_err(|_| StoreError::Connection(format!("PING timed out after {:?}", config.timeout)))??;

        Ok(store)
    }
}

fn command_error(e: redis::RedisError) -> StoreError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

/// Escape glob metacharacters so a literal prefix can be used in `MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

struct ScanCursor {
    conn: ConnectionManager,
    pattern: String,
    cursor: u64,
    buffer: VecDeque<String>,
    finished: bool,
}

#[async_trait]
impl KvStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed = redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let count = redis::cmd("EXISTS")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(count > 0)
    }

    fn scan_keys(&self, prefix: &str) -> KeyStream {
        let start = ScanCursor {
            conn: self.conn.clone(),
            pattern: format!("{}*", glob_escape(prefix)),
            cursor: 0,
            buffer: VecDeque::new(),
            finished: false,
        };

        stream::unfold(start, |mut st| async move {
            loop {
                if let Some(key) = st.buffer.pop_front() {
                    return Some((Ok(key), st));
                }
                if st.finished {
                    return None;
                }

                let batch = redis::cmd("SCAN")
                    .arg(st.cursor)
                    .arg("MATCH")
                    .arg(&st.pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async::<(u64, Vec<String>)>(&mut st.conn)
                    .await;

                match batch {
                    Ok((next, keys)) => {
                        st.cursor = next;
                        st.finished = next == 0;
                        st.buffer.extend(keys);
                    }
                    Err(e) => {
                        st.finished = true;
                        return Some((Err(command_error(e)), st));
                    }
                }
            }
        })
        .boxed()
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(command_error)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(removed > 0)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async::<HashMap<String, String>>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let reply = redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(command_error)?;

        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {reply}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_escape() {
        assert_eq!(glob_escape("chat_session:"), "chat_session:");
        assert_eq!(glob_escape("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[test]
    fn test_redis_config_default() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connect_invalid_url_fails() {
        let config = RedisStoreConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            RedisStore::connect(&config).await,
            Err(StoreError::Connection(_))
        ));
    }
}

// ============================================================================
// Redis Integration Tests (requires running Redis server)
// ============================================================================

#[cfg(test)]
mod redis_tests {
    use super::*;

    async fn redis_store() -> Option<RedisStore> {
        let config = RedisStoreConfig {
            timeout: Duration::from_millis(500),
            ..Default::default()
        };
        RedisStore::connect(&config).await.ok()
    }

    #[tokio::test]
    async fn test_redis_string_and_scan() {
        let Some(store) = redis_store().await else {
            eprintln!("Skipping Redis test: Redis not available");
            return;
        };

        store.set("tutor_test:scan:a", "1").await.unwrap();
        store.set("tutor_test:scan:b", "2").await.unwrap();

        let keys: Vec<String> = store
            .scan_keys("tutor_test:scan:")
            .filter_map(|k| async move { k.ok() })
            .collect()
            .await;
        assert!(keys.contains(&"tutor_test:scan:a".to_string()));
        assert!(keys.contains(&"tutor_test:scan:b".to_string()));

        assert!(store.delete("tutor_test:scan:a").await.unwrap());
        assert!(store.delete("tutor_test:scan:b").await.unwrap());
        assert_eq!(store.get("tutor_test:scan:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_redis_hash() {
        let Some(store) = redis_store().await else {
            eprintln!("Skipping Redis test: Redis not available");
            return;
        };

        store.hash_set("tutor_test:prompts", "a", "x").await.unwrap();
        assert_eq!(
            store.hash_get("tutor_test:prompts", "a").await.unwrap().as_deref(),
            Some("x")
        );
        assert!(store.hash_delete("tutor_test:prompts", "a").await.unwrap());
        assert!(!store.exists("tutor_test:prompts").await.unwrap());
    }
}
