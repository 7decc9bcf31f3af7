//! Fixed-window counter store.
//!
//! The distributed counter lives in Redis. Increment, first-hit expiry and the
//! TTL read happen inside one Lua script, so replicas sharing the store are
//! linearized by Redis itself and agree on when a window ends.

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Counter state after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Post-increment value of the counter
    pub count: u64,
    /// Time left until the window resets
    pub ttl: Duration,
}

/// The counter store could not serve a request.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Counter store did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Could not set expiry on new counter '{key}'")]
    ExpiryNotSet { key: String },
}

/// A shared store of fixed-window counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key`, starting a window of length `window` when
    /// the counter is created, and report the count and remaining window.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError>;

    /// Check that the store is reachable.
    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Returns `{count, pttl, expiry_ok}`. A new counter whose expiry cannot be
/// set, whether PEXPIRE returns 0 or raises, is deleted so it cannot outlive
/// its window.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    local expiry = redis.pcall('PEXPIRE', KEYS[1], ARGV[1])
    if type(expiry) ~= 'number' or expiry ~= 1 then
        redis.call('DEL', KEYS[1])
        return {count, -2, 0}
    end
end
return {count, redis.call('PTTL', KEYS[1]), 1}
"#;

/// Redis-backed counter store.
pub struct RedisCounterStore {
    client: redis::Client,
    /// Cached connection, dropped after any failure and re-opened lazily.
    connection: RwLock<Option<MultiplexedConnection>>,
    script: redis::Script,
    timeout: Duration,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("timeout", &self.timeout)
            .field("connected", &self.connection.read().is_some())
            .finish()
    }
}

impl RedisCounterStore {
    /// Create a store for `url`. No connection is made until first use.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: RwLock::new(None),
            script: redis::Script::new(INCREMENT_SCRIPT),
            timeout,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let cached = self.connection.read().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let conn = tokio::time::timeout(self.timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;

        info!("Connected to Redis counter store");
        *self.connection.write() = Some(conn.clone());
        Ok(conn)
    }

    fn invalidate(&self, err: &StoreError) {
        if self.connection.write().take().is_some() {
            debug!(error = %err, "Dropping cached Redis connection");
        }
    }

    async fn run_increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let mut conn = self.connection().await?;
        let window_ms = window.as_millis() as u64;

        let (count, pttl, expiry_ok): (u64, i64, i64) = tokio::time::timeout(
            self.timeout,
            self.script.key(key).arg(window_ms).invoke_async(&mut conn),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.timeout))??;

        if expiry_ok == 0 {
            return Err(StoreError::ExpiryNotSet {
                key: key.to_string(),
            });
        }

        let ttl = remaining_ttl(pttl, window);
        trace!(key = %key, count = count, ttl_ms = ttl.as_millis() as u64, "Incremented Redis counter");
        Ok(WindowCount { count, ttl })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _pong: String = tokio::time::timeout(self.timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        self.run_increment(key, window).await.inspect_err(|e| self.invalidate(e))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.ping().await.inspect_err(|e| self.invalidate(e))
    }
}

/// PTTL reports -1 for a key with no expiry and -2 for a missing key; both
/// count as a full window.
fn remaining_ttl(pttl: i64, window: Duration) -> Duration {
    if pttl < 0 {
        window
    } else {
        Duration::from_millis(pttl as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_ttl_normalizes_missing_expiry() {
        let window = Duration::from_secs(60);
        assert_eq!(remaining_ttl(-1, window), window);
        assert_eq!(remaining_ttl(-2, window), window);
        assert_eq!(remaining_ttl(41_500, window), Duration::from_millis(41_500));
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RedisCounterStore::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_store_fails() {
        // Nothing listens on port 1.
        let store = RedisCounterStore::new("redis://127.0.0.1:1", Duration::from_millis(500)).unwrap();
        assert!(store.increment("ratelimit:test", Duration::from_secs(1)).await.is_err());
        assert!(store.health_check().await.is_err());
    }

    fn test_store() -> Option<RedisCounterStore> {
        let url = std::env::var("TOLLGATE_TEST_REDIS_URL").ok()?;
        Some(RedisCounterStore::new(&url, Duration::from_secs(2)).unwrap())
    }

    #[tokio::test]
    #[ignore = "requires TOLLGATE_TEST_REDIS_URL"]
    async fn test_redis_fixed_window() {
        let Some(store) = test_store() else { return };
        let key = format!("ratelimit:test:{}", uuid::Uuid::new_v4());
        let window = Duration::from_secs(30);

        let first = store.increment(&key, window).await.unwrap();
        assert_eq!(first.count, 1);
        assert!(first.ttl <= window && first.ttl > Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(50)).await;

        // A later increment keeps the original expiry.
        let second = store.increment(&key, window).await.unwrap();
        assert_eq!(second.count, 2);
        assert!(second.ttl < first.ttl);

        store.health_check().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires TOLLGATE_TEST_REDIS_URL"]
    async fn test_redis_rejected_expiry_removes_counter() {
        let Some(store) = test_store() else { return };
        let key = format!("ratelimit:test:{}", uuid::Uuid::new_v4());

        // PEXPIRE errors on an expire time this large.
        let result = store.increment(&key, Duration::from_millis(u64::MAX)).await;
        assert!(matches!(result, Err(StoreError::ExpiryNotSet { .. })));

        let first = store.increment(&key, Duration::from_secs(30)).await.unwrap();
        assert_eq!(first.count, 1);
    }
}
