//! Redis-backed counter store.

use crate::error::StoreError;
use crate::store::CounterStore;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;
use tracing::{info, instrument};

/// Default per-operation timeout in milliseconds.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 250;

/// Connection settings for [`RedisCounterStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379/0`).
    pub url: String,
    /// Upper bound on a single command's latency. Exceeding it is reported
    /// as [`StoreError::Timeout`] so callers can fail open quickly.
    pub operation_timeout: Duration,
}

impl RedisStoreConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
        }
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

/// Counter store backed by Redis.
///
/// Holds a multiplexed connection manager that reconnects on its own; the
/// handle is cheap to clone.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    operation_timeout: Duration,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the URL is invalid or the
    /// initial connection cannot be established.
    #[instrument(skip(config), fields(operation_timeout_ms = u64::try_from(config.operation_timeout.as_millis()).unwrap_or(u64::MAX)))]
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client).await?;

        info!("Connected to counter store");

        Ok(Self {
            conn,
            operation_timeout: config.operation_timeout,
        })
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.operation_timeout, op).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(
                u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.get::<_, Option<String>>(key).await })
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            match ttl_secs {
                Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.max(1)).await,
                None => conn.set::<_, _, ()>(key, value).await,
            }
        })
        .await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.incr::<_, _, i64>(key, 1_i64).await })
            .await
            .map_err(|e| match e {
                StoreError::InvalidValue { message, .. } => StoreError::InvalidValue {
                    key: key.to_string(),
                    message,
                },
                other => other,
            })
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let ttl = i64::try_from(ttl_secs.max(1)).unwrap_or(i64::MAX);
        self.bounded(async move { conn.expire::<_, ()>(key, ttl).await })
            .await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.del::<_, ()>(key).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RedisStoreConfig::new("redis://localhost");
        assert_eq!(config.url, "redis://localhost");
        assert_eq!(
            config.operation_timeout,
            Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS)
        );
    }

    #[test]
    fn test_config_with_timeout() {
        let config =
            RedisStoreConfig::new("redis://localhost").with_operation_timeout(Duration::from_secs(1));
        assert_eq!(config.operation_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_invalid_url_is_unavailable() {
        let result = RedisCounterStore::connect(RedisStoreConfig::new("not a url")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_connect_with_unbounded_timeout() {
        let config = RedisStoreConfig::new("not a url").with_operation_timeout(Duration::MAX);
        let result = RedisCounterStore::connect(config).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
