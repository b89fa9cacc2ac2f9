//! Hash-store backends for the shared cache
//!
//! `HashStore` is the small command surface the shared cache needs. The Redis
//! backend talks to the server every worker can reach; the memory backend is
//! the per-process fallback used when Redis is absent or circuit-broken.

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection dropped, refused or timed out; counted by the circuit breaker
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store command error: {0}")]
    Command(String),
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() || e.is_timeout()
        {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One write in a pipelined batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOp {
    Set {
        key: String,
        field: String,
        value: String,
    },
    Delete {
        key: String,
        field: String,
    },
    DeleteKey {
        key: String,
    },
}

impl HashOp {
    pub fn set(key: &str, field: impl Into<String>, value: impl Into<String>) -> Self {
        HashOp::Set {
            key: key.to_string(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: &str, field: impl Into<String>) -> Self {
        HashOp::Delete {
            key: key.to_string(),
            field: field.into(),
        }
    }
}

#[async_trait]
pub trait HashStore: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Values for `fields`, in order
    async fn hmget(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hvals(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn hlen(&self, key: &str) -> StoreResult<usize>;

    /// Apply all ops in a single round trip. Not atomic.
    async fn apply(&self, ops: Vec<HashOp>) -> StoreResult<()>;

    /// Set a plain key only if absent, expiring after `ttl`
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn ping(&self) -> StoreResult<()>;

    fn backend_name(&self) -> &'static str;
}

// ============================================================================
// Redis backend
// ============================================================================

#[derive(Clone)]
pub struct RedisHashStore {
    conn: ConnectionManager,
}

impl RedisHashStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl HashStore for RedisHashStore {
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget::<_, _, Option<String>>(key, field).await?)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        Ok(redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async::<_, Vec<Option<String>>>(&mut conn)
            .await?)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall::<_, HashMap<String, String>>(key).await?)
    }

    async fn hvals(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hvals::<_, Vec<String>>(key).await?)
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.hlen::<_, usize>(key).await?)
    }

    async fn apply(&self, ops: Vec<HashOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for op in &ops {
            match op {
                HashOp::Set { key, field, value } => {
                    pipe.hset(key, field, value).ignore();
                }
                HashOp::Delete { key, field } => {
                    pipe.hdel(key, field).ignore();
                }
                HashOp::DeleteKey { key } => {
                    pipe.del(key).ignore();
                }
            }
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

// ============================================================================
// In-process backend
// ============================================================================

/// Process-local hash store with server-side-style key expiry
#[derive(Default)]
pub struct MemoryHashStore {
    hashes: RwLock<HashMap<String, HashMap<String, String>>>,
    values: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every hash and value
    pub fn clear(&self) {
        self.hashes.write().clear();
        self.values.write().clear();
    }

    fn live_value(&self, key: &str, now: Instant) -> Option<String> {
        let mut values = self.values.write();
        match values.get(key) {
            Some((_, expires_at)) if *expires_at <= now => {
                values.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl HashStore for MemoryHashStore {
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self
            .hashes
            .read()
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>> {
        let hashes = self.hashes.read();
        let hash = hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(f).cloned()))
            .collect())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self.hashes.read().get(key).cloned().unwrap_or_default())
    }

    async fn hvals(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .hashes
            .read()
            .get(key)
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        Ok(self.hashes.read().get(key).map(|h| h.len()).unwrap_or(0))
    }

    async fn apply(&self, ops: Vec<HashOp>) -> StoreResult<()> {
        let mut hashes = self.hashes.write();
        for op in ops {
            match op {
                HashOp::Set { key, field, value } => {
                    hashes.entry(key).or_default().insert(field, value);
                }
                HashOp::Delete { key, field } => {
                    if let Some(hash) = hashes.get_mut(&key) {
                        hash.remove(&field);
                        if hash.is_empty() {
                            hashes.remove(&key);
                        }
                    }
                }
                HashOp::DeleteKey { key } => {
                    hashes.remove(&key);
                    self.values.write().remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        if self.live_value(key, now).is_some() {
            return Ok(false);
        }
        self.values
            .write()
            .insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.live_value(key, Instant::now()))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_hash_ops() {
        let store = MemoryHashStore::new();
        store
            .apply(vec![
                HashOp::set("h", "a", "1"),
                HashOp::set("h", "b", "2"),
                HashOp::set("other", "x", "9"),
            ])
            .await
            .unwrap();

        assert_eq!(store.hget("h", "a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.hlen("h").await.unwrap(), 2);
        assert_eq!(
            store
                .hmget("h", &["b".to_string(), "zz".to_string()])
                .await
                .unwrap(),
            vec![Some("2".to_string()), None]
        );

        store
            .apply(vec![
                HashOp::delete("h", "a"),
                HashOp::DeleteKey {
                    key: "other".to_string(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.hlen("h").await.unwrap(), 1);
        assert!(store.hgetall("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_set_nx_respects_ttl() {
        let store = MemoryHashStore::new();
        assert!(store.set_nx_ex("flag", "w1", Duration::from_millis(30)).await.unwrap());
        assert!(!store.set_nx_ex("flag", "w2", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("flag").await.unwrap().as_deref(), Some("w1"));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(store.get("flag").await.unwrap(), None);
        assert!(store.set_nx_ex("flag", "w2", Duration::from_secs(5)).await.unwrap());
    }

    #[test]
    fn test_store_error_classification() {
        let io = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(StoreError::from(io).is_connection());

        let typed = RedisError::from((redis::ErrorKind::TypeError, "bad type"));
        assert!(!StoreError::from(typed).is_connection());
    }
}
