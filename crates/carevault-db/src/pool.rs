//! Postgres connection pool.
//!
//! Every connection returned to the pool has its security context cleared a
//! second time by an `after_release` hook; a connection whose context cannot
//! be cleared is closed instead of being reused.

use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use crate::context::release_session;
use crate::error::DbError;

/// Pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct DbPoolConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl DbPoolConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Shared Postgres connection pool.
#[derive(Debug, Clone)]
pub struct DbPool {
    inner: PgPool,
}

impl DbPool {
    /// Connect with default pool settings.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        Self::connect_with(&DbPoolConfig::new(url)).await
    }

    /// Connect with explicit pool settings.
    #[tracing::instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect_with(config: &DbPoolConfig) -> Result<Self, DbError> {
        let inner = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .after_release(|conn, _meta| {
                Box::pin(async move {
                    // Ok(false) tells the pool to close the connection.
                    let cleared = release_session(conn).await;
                    if !cleared {
                        tracing::error!(
                            target: "tenant_context",
                            "Discarding pooled connection whose security context could not be cleared"
                        );
                    }
                    Ok(cleared)
                })
            })
            .connect(&config.url)
            .await
            .map_err(DbError::ConnectionFailed)?;

        tracing::info!("Database pool connected");
        Ok(Self { inner })
    }

    /// Wrap an existing pool (tests).
    #[must_use]
    pub fn from_pool(inner: PgPool) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn inner(&self) -> &PgPool {
        &self.inner
    }

    /// Acquire a connection.
    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>, DbError> {
        self.inner.acquire().await.map_err(DbError::ConnectionFailed)
    }

    /// Begin a transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, DbError> {
        self.inner.begin().await.map_err(DbError::ConnectionFailed)
    }

    /// Close every connection.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}
