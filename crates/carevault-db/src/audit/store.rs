//! Audit persistence.
//!
//! The [`AuditStore`] trait exposes inserts and reads plus the single
//! deletion path used by retention. There is no update method.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use carevault_core::{SharedClock, SystemClock};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::model::{AuditLogEntry, AuditLogFilter, NewAuditEntry};
use crate::error::DbError;
use crate::pool::DbPool;

const ENTRY_COLUMNS: &str = "id, action, origin, receiver_identifier, issuer_identifier, \
     actor_identifier_hash, resource_type, resource_id, ip_address, user_agent, status, \
     created_at, metadata";

/// Storage backend for audit entries.
#[async_trait]
pub trait AuditStore: Send + Sync + std::fmt::Debug {
    async fn insert(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, DbError>;

    async fn find(&self, id: Uuid) -> Result<Option<AuditLogEntry>, DbError>;

    /// Newest first.
    async fn list(&self, filter: &AuditLogFilter, limit: i64) -> Result<Vec<AuditLogEntry>, DbError>;

    /// Delete every entry created before `cutoff`. Returns the number removed.
    ///
    /// Authorization and retention checks are the caller's responsibility;
    /// see [`AuditWriter::purge_before`](super::AuditWriter::purge_before).
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError>;
}

/// Shared handle to an audit store.
pub type SharedAuditStore = Arc<dyn AuditStore>;

/// Postgres-backed audit store.
///
/// Writes use their own pooled connection, not the request's session, so an
/// entry persists whatever happens to the surrounding business operation.
/// Give it a pool separate from the broker's so audit writes never queue
/// behind request sessions.
#[derive(Debug, Clone)]
pub struct PgAuditStore {
    pool: DbPool,
}

impl PgAuditStore {
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    #[tracing::instrument(skip(self, entry), fields(action = %entry.action, status = %entry.status))]
    async fn insert(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, DbError> {
        let query = format!(
            r"
            INSERT INTO audit_log
                (action, origin, receiver_identifier, issuer_identifier, actor_identifier_hash,
                 resource_type, resource_id, ip_address, user_agent, status, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {ENTRY_COLUMNS}
            "
        );
        sqlx::query_as::<_, AuditLogEntry>(&query)
            .bind(entry.action.to_string())
            .bind(entry.origin.to_string())
            .bind(entry.receiver_identifier)
            .bind(entry.issuer_identifier)
            .bind(entry.actor_identifier_hash)
            .bind(entry.resource_type)
            .bind(entry.resource_id)
            .bind(entry.ip_address)
            .bind(entry.user_agent)
            .bind(entry.status.to_string())
            .bind(entry.metadata)
            .fetch_one(self.pool.inner())
            .await
            .map_err(DbError::from_query)
    }

    async fn find(&self, id: Uuid) -> Result<Option<AuditLogEntry>, DbError> {
        let query = format!("SELECT {ENTRY_COLUMNS} FROM audit_log WHERE id = $1");
        sqlx::query_as::<_, AuditLogEntry>(&query)
            .bind(id)
            .fetch_optional(self.pool.inner())
            .await
            .map_err(DbError::from_query)
    }

    async fn list(&self, filter: &AuditLogFilter, limit: i64) -> Result<Vec<AuditLogEntry>, DbError> {
        let mut conditions = vec!["TRUE".to_string()];
        let mut param_idx = 1;

        if filter.action.is_some() {
            conditions.push(format!("action = ${param_idx}"));
            param_idx += 1;
        }
        if filter.status.is_some() {
            conditions.push(format!("status = ${param_idx}"));
            param_idx += 1;
        }
        if filter.actor_identifier_hash.is_some() {
            conditions.push(format!("actor_identifier_hash = ${param_idx}"));
            param_idx += 1;
        }
        if filter.start_date.is_some() {
            conditions.push(format!("created_at >= ${param_idx}"));
            param_idx += 1;
        }
        if filter.end_date.is_some() {
            conditions.push(format!("created_at <= ${param_idx}"));
            param_idx += 1;
        }

        let where_clause = conditions.join(" AND ");
        let query = format!(
            r"
            SELECT {ENTRY_COLUMNS}
            FROM audit_log
            WHERE {where_clause}
            ORDER BY created_at DESC
            LIMIT ${param_idx}
            "
        );

        let mut q = sqlx::query_as::<_, AuditLogEntry>(&query);
        if let Some(action) = filter.action {
            q = q.bind(action.to_string());
        }
        if let Some(status) = filter.status {
            q = q.bind(status.to_string());
        }
        if let Some(hash) = &filter.actor_identifier_hash {
            q = q.bind(hash);
        }
        if let Some(start_date) = filter.start_date {
            q = q.bind(start_date);
        }
        if let Some(end_date) = filter.end_date {
            q = q.bind(end_date);
        }
        q = q.bind(limit);

        q.fetch_all(self.pool.inner())
            .await
            .map_err(DbError::from_query)
    }

    #[tracing::instrument(skip(self))]
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
        let mut tx = self.pool.begin().await?;

        // The immutability trigger only admits deletes while this flag is set,
        // and it is transaction-local.
        sqlx::query("SELECT set_config('app.audit_retention_purge', 'on', true)")
            .execute(&mut *tx)
            .await
            .map_err(DbError::from_query)?;

        let result = sqlx::query("DELETE FROM audit_log WHERE created_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from_query)?;

        tx.commit().await.map_err(DbError::from_query)?;
        Ok(result.rows_affected())
    }
}

/// In-process audit store for tests and local development.
#[derive(Debug, Clone)]
pub struct MemoryAuditStore {
    entries: Arc<Mutex<Vec<AuditLogEntry>>>,
    failing: Arc<AtomicBool>,
    clock: SharedClock,
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::with_clock(SystemClock::shared())
    }
}

impl MemoryAuditStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(AtomicBool::new(false)),
            clock,
        }
    }

    /// Make every operation fail as if the database were down.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of all stored entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().clone()
    }

    fn check(&self) -> Result<(), DbError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(DbError::Unavailable("audit store unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn insert(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, DbError> {
        self.check()?;
        let stored = AuditLogEntry {
            id: Uuid::new_v4(),
            action: entry.action.to_string(),
            origin: entry.origin.to_string(),
            receiver_identifier: entry.receiver_identifier,
            issuer_identifier: entry.issuer_identifier,
            actor_identifier_hash: entry.actor_identifier_hash,
            resource_type: entry.resource_type,
            resource_id: entry.resource_id,
            ip_address: entry.ip_address,
            user_agent: entry.user_agent,
            status: entry.status.to_string(),
            created_at: self.clock.now(),
            metadata: entry.metadata,
        };
        self.entries.lock().push(stored.clone());
        Ok(stored)
    }

    async fn find(&self, id: Uuid) -> Result<Option<AuditLogEntry>, DbError> {
        self.check()?;
        Ok(self.entries.lock().iter().find(|e| e.id == id).cloned())
    }

    async fn list(&self, filter: &AuditLogFilter, limit: i64) -> Result<Vec<AuditLogEntry>, DbError> {
        self.check()?;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .entries
            .lock()
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
        self.check()?;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.created_at >= cutoff);
        Ok(u64::try_from(before - entries.len()).unwrap_or(u64::MAX))
    }
}
