//! Redis-backed store.
//!
//! Buckets live in a hash per key (`tokens`, `timestamp`). The procedure runs
//! as a Lua script, which Redis executes without interleaving any other
//! command.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{debug, info, trace};

use super::SharedStateStore;
use crate::error::StoreError;
use crate::ratelimit::{BucketArgs, TokenBucketProcedure};

/// Deadline for the liveness probe issued by `connect`.
const PING_DEADLINE: Duration = Duration::from_secs(2);

/// Connection settings for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// `host:port`, or a full `redis://` / `rediss://` URL.
    pub addr: String,
    /// Logical database index.
    pub db: i64,
    /// Bound on establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Bound on each command's reply.
    pub response_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:6379".to_string(),
            db: 0,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(3),
        }
    }
}

impl RedisStoreConfig {
    fn url(&self) -> String {
        if self.addr.contains("://") {
            self.addr.clone()
        } else {
            format!("redis://{}/{}", self.addr, self.db)
        }
    }
}

/// A store handle over a multiplexed Redis connection.
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct RedisStore {
    addr: String,
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.addr)
            .finish()
    }
}

impl RedisStore {
    /// Open a connection and verify the server answers `PING`.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        info!(
            addr = %config.addr,
            db = config.db,
            connect_timeout = ?config.connect_timeout,
            response_timeout = ?config.response_timeout,
            "Connecting to redis"
        );

        let unreachable = |reason: String| StoreError::Connection {
            addr: config.addr.clone(),
            reason,
        };

        let client = redis::Client::open(config.url()).map_err(|e| unreachable(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection_with_timeouts(
                config.response_timeout,
                config.connect_timeout,
            )
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let store = Self {
            addr: config.addr.clone(),
            conn,
        };

        let reply = tokio::time::timeout(PING_DEADLINE, store.ping())
            .await
            .map_err(|_| unreachable(format!("no PING reply within {:?}", PING_DEADLINE)))?
            .map_err(|e| unreachable(e.to_string()))?;

        debug!(addr = %store.addr, reply = %reply, "Redis liveness probe succeeded");
        Ok(store)
    }

    /// The address this store was opened with.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl SharedStateStore for RedisStore {
    async fn run_atomic(
        &self,
        key: &str,
        procedure: &TokenBucketProcedure,
        args: &BucketArgs,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();

        let mut invocation = procedure.script().prepare_invoke();
        invocation.key(key).arg(*args);

        let reply: i64 = invocation.invoke_async(&mut conn).await?;

        trace!(key = %key, reply = reply, "Bucket procedure evaluated");

        match reply {
            0 | 1 => Ok(reply),
            other => Err(StoreError::Protocol(format!(
                "procedure returned {}, expected 0 or 1",
                other
            ))),
        }
    }

    async fn ping(&self) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::ratelimit::TokenBucketLimiter;

    fn test_config() -> RedisStoreConfig {
        RedisStoreConfig {
            addr: std::env::var("TOLLGATE_TEST_REDIS_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:6379".to_string()),
            db: 15,
            ..Default::default()
        }
    }

    fn unique_key(name: &str) -> String {
        format!("ratelimit:test:{}:{}", name, rand::random::<u64>())
    }

    #[test]
    fn test_url_from_host_and_db() {
        let config = RedisStoreConfig {
            addr: "cache.internal:6380".to_string(),
            db: 3,
            ..Default::default()
        };
        assert_eq!(config.url(), "redis://cache.internal:6380/3");
    }

    #[test]
    fn test_url_passthrough() {
        let config = RedisStoreConfig {
            addr: "rediss://user:pw@cache.internal:6380/1".to_string(),
            ..Default::default()
        };
        assert_eq!(config.url(), "rediss://user:pw@cache.internal:6380/1");
    }

    #[tokio::test]
    async fn test_connect_unreachable_is_connection_error() {
        let config = RedisStoreConfig {
            addr: "127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        };

        let err = RedisStore::connect(config).await.unwrap_err();
        assert!(matches!(err, StoreError::Connection { .. }));
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_redis_capacity_then_refill() {
        let store = Arc::new(RedisStore::connect(test_config()).await.unwrap());
        let limiter = TokenBucketLimiter::new(store, 3, Duration::from_secs(1));
        let key = unique_key("scenario");

        for i in 0..3 {
            assert!(limiter.allow(&key).await.unwrap(), "request {} should pass", i);
        }
        assert!(!limiter.allow(&key).await.unwrap());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(limiter.allow(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_redis_sets_expiry_and_fields() {
        let store = RedisStore::connect(test_config()).await.unwrap();
        let limiter = TokenBucketLimiter::new(Arc::new(store.clone()), 10, Duration::from_secs(30));
        let key = unique_key("ttl");

        assert!(limiter.allow_n(&key, 4).await.unwrap());

        let mut conn = store.conn.clone();
        let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await.unwrap();
        assert!(ttl > 0 && ttl <= 60, "ttl was {}", ttl);

        let (tokens, timestamp): (f64, i64) = redis::cmd("HMGET")
            .arg(&key)
            .arg("tokens")
            .arg("timestamp")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(tokens, 6.0);
        assert!(timestamp > 0);
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_redis_concurrent_requests_never_overspend() {
        let store = Arc::new(RedisStore::connect(test_config()).await.unwrap());
        let limiter = Arc::new(TokenBucketLimiter::new(store, 20, Duration::from_secs(3600)));
        let key = unique_key("concurrent");

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                let key = key.clone();
                tokio::spawn(async move { limiter.allow(&key).await.unwrap() })
            })
            .collect();

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 20);
    }
}
