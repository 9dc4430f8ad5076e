use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::Instant;

// get/compare/del must run as one server-side operation, otherwise a record
// that expires between the read and the delete can be deleted out from under
// a new holder.
const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end"#;

/// A key-value store that can host lock records.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Hands out a connection scoped to one caller.
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// The two primitives the lock protocol runs on. Both must execute as a
/// single atomic operation at the store.
#[async_trait]
pub trait Connection: Send {
    /// Creates `key = value` with expiry `ttl`, only if `key` is absent.
    /// Returns whether the record was created.
    async fn set_if_absent(&mut self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Deletes `key` only if its current value equals `expected`. Returns
    /// whether a record was deleted.
    async fn compare_and_delete(&mut self, key: &str, expected: &str) -> Result<bool>;
}

/// Lock records in Redis: `SET NX PX` to create, a server-side script to
/// compare-and-delete.
pub struct RedisBackend {
    client: redis::Client,
}

impl RedisBackend {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("redis connect")?;
        Ok(Box::new(RedisConnection { conn }))
    }
}

struct RedisConnection {
    conn: redis::aio::MultiplexedConnection,
}

#[async_trait]
impl Connection for RedisConnection {
    async fn set_if_absent(&mut self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        // PX rather than EX so sub-second expiries keep their grain.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut self.conn)
            .await
            .context("SET NX PX")?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&mut self, key: &str, expected: &str) -> Result<bool> {
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn)
            .await
            .context("release script")?;
        Ok(deleted == 1)
    }
}

/// In-process backend with lazy TTL expiry. A drop-in stand-in for tests and
/// for callers that only need to serialize within one process.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    records: Arc<Mutex<HashMap<String, Record>>>,
}

struct Record {
    value: String,
    expires_at: Instant,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(MemoryConnection {
            records: self.records.clone(),
        }))
    }
}

struct MemoryConnection {
    records: Arc<Mutex<HashMap<String, Record>>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn set_if_absent(&mut self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut records = self.records.lock().unwrap();
        let now = Instant::now();
        match records.get(key) {
            Some(rec) if rec.expires_at > now => Ok(false),
            _ => {
                records.insert(
                    key.to_string(),
                    Record {
                        value: value.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&mut self, key: &str, expected: &str) -> Result<bool> {
        let mut records = self.records.lock().unwrap();
        let now = Instant::now();
        let held = match records.get(key) {
            Some(rec) => rec.expires_at > now && rec.value == expected,
            None => false,
        };
        if held {
            records.remove(key);
        }
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn memory_records_expire() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().await.unwrap();
        assert!(
            conn.set_if_absent("k", "a", Duration::from_millis(100))
                .await
                .unwrap()
        );
        assert!(
            !conn
                .set_if_absent("k", "b", Duration::from_millis(100))
                .await
                .unwrap()
        );
        sleep(Duration::from_millis(150)).await;
        assert!(
            conn.set_if_absent("k", "b", Duration::from_millis(100))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn memory_compare_and_delete_checks_the_value() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().await.unwrap();
        assert!(
            conn.set_if_absent("k", "a", Duration::from_secs(10))
                .await
                .unwrap()
        );
        assert!(!conn.compare_and_delete("k", "b").await.unwrap());
        // still held by "a"
        assert!(
            !conn
                .set_if_absent("k", "c", Duration::from_secs(10))
                .await
                .unwrap()
        );
        assert!(conn.compare_and_delete("k", "a").await.unwrap());
        assert!(!conn.compare_and_delete("k", "a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn memory_expired_record_cannot_be_deleted() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().await.unwrap();
        assert!(
            conn.set_if_absent("k", "a", Duration::from_millis(50))
                .await
                .unwrap()
        );
        sleep(Duration::from_millis(100)).await;
        assert!(!conn.compare_and_delete("k", "a").await.unwrap());
    }

    #[tokio::test]
    async fn memory_connections_share_one_store() {
        let backend = MemoryBackend::new();
        let mut c1 = backend.connect().await.unwrap();
        let mut c2 = backend.connect().await.unwrap();
        assert!(
            c1.set_if_absent("k", "a", Duration::from_secs(10))
                .await
                .unwrap()
        );
        assert!(
            !c2.set_if_absent("k", "b", Duration::from_secs(10))
                .await
                .unwrap()
        );
        assert!(c2.compare_and_delete("k", "a").await.unwrap());
    }
}
