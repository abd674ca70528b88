//! Audit writer.

use carevault_core::{Principal, SharedClock, SystemClock};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::model::{
    AuditAction, AuditLogEntry, AuditLogFilter, AuditOrigin, AuditStatus, NewAuditEntry,
};
use super::store::SharedAuditStore;
use crate::error::DbError;

/// Default minimum retention: six years.
pub const DEFAULT_MIN_RETENTION_DAYS: i64 = 6 * 365;

/// Maximum page size for [`AuditWriter::list`].
pub const MAX_LIST_LIMIT: i64 = 500;

/// Audit errors.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The entry could not be persisted or read.
    #[error("audit store failure: {0}")]
    Store(#[from] DbError),

    /// Only administrators may purge the audit log.
    #[error("retention purge requires an administrator")]
    NotAuthorized,

    /// The cutoff would delete entries still inside the retention period.
    #[error("cutoff {cutoff} is inside the retention period (latest allowed {latest_allowed})")]
    RetentionPeriod {
        cutoff: DateTime<Utc>,
        latest_allowed: DateTime<Utc>,
    },
}

/// Writes and reads the append-only audit log.
#[derive(Debug, Clone)]
pub struct AuditWriter {
    store: SharedAuditStore,
    min_retention: Duration,
    clock: SharedClock,
}

impl AuditWriter {
    #[must_use]
    pub fn new(store: SharedAuditStore) -> Self {
        Self {
            store,
            min_retention: Duration::days(DEFAULT_MIN_RETENTION_DAYS),
            clock: SystemClock::shared(),
        }
    }

    #[must_use]
    pub fn with_min_retention(mut self, min_retention: Duration) -> Self {
        self.min_retention = min_retention;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn min_retention(&self) -> Duration {
        self.min_retention
    }

    /// Persist one entry.
    ///
    /// A failure is logged at ERROR and returned; callers whose deliverable
    /// is the audit record must fail the request.
    pub async fn record(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, AuditError> {
        let action = entry.action;
        let status = entry.status;
        match self.store.insert(entry).await {
            Ok(stored) => {
                tracing::debug!(
                    target: "audit",
                    id = %stored.id,
                    action = %action,
                    status = %status,
                    "Audit entry recorded"
                );
                Ok(stored)
            }
            Err(err) => {
                tracing::error!(
                    target: "audit",
                    action = %action,
                    status = %status,
                    error = %err,
                    "Failed to write audit entry"
                );
                Err(AuditError::Store(err))
            }
        }
    }

    /// Persist one entry, logging and discarding any failure.
    pub async fn record_best_effort(&self, entry: NewAuditEntry) {
        let _ = self.record(entry).await;
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<AuditLogEntry>, AuditError> {
        Ok(self.store.find(id).await?)
    }

    /// Newest first; `limit` is clamped to `1..=MAX_LIST_LIMIT`.
    pub async fn list(
        &self,
        filter: &AuditLogFilter,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>, AuditError> {
        Ok(self
            .store
            .list(filter, limit.clamp(1, MAX_LIST_LIMIT))
            .await?)
    }

    /// Delete entries created before `cutoff`.
    ///
    /// Re-checks at call time that `actor` is an administrator and that
    /// `cutoff` lies at least the minimum retention period in the past. The
    /// purge itself is recorded as a new entry.
    pub async fn purge_before(
        &self,
        actor: &Principal,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AuditError> {
        if !actor.is_admin() {
            tracing::warn!(
                target: "audit",
                actor = %actor,
                "Retention purge rejected: actor is not an administrator"
            );
            self.record_best_effort(
                NewAuditEntry::new(
                    AuditAction::RetentionPurge,
                    AuditOrigin::AuthenticatedApi,
                    AuditStatus::Denied,
                )
                .actor(actor.id())
                .with_metadata("cutoff", cutoff.to_rfc3339()),
            )
            .await;
            return Err(AuditError::NotAuthorized);
        }

        let latest_allowed = self.clock.now() - self.min_retention;
        if cutoff > latest_allowed {
            tracing::warn!(
                target: "audit",
                actor = %actor,
                cutoff = %cutoff,
                latest_allowed = %latest_allowed,
                "Retention purge rejected: cutoff inside retention period"
            );
            return Err(AuditError::RetentionPeriod {
                cutoff,
                latest_allowed,
            });
        }

        let removed = self.store.purge_before(cutoff).await?;
        tracing::info!(
            target: "audit",
            actor = %actor,
            cutoff = %cutoff,
            removed,
            "Audit retention purge completed"
        );

        self.record(
            NewAuditEntry::new(
                AuditAction::RetentionPurge,
                AuditOrigin::AuthenticatedApi,
                AuditStatus::Success,
            )
            .actor(actor.id())
            .with_metadata("cutoff", cutoff.to_rfc3339())
            .with_metadata("removed", removed),
        )
        .await?;

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::store::MemoryAuditStore;
    use carevault_core::{Clock, ManualClock, Role};
    use std::sync::Arc;

    const NOW: i64 = 1_900_000_000;

    fn writer() -> (AuditWriter, MemoryAuditStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at(NOW));
        let store = MemoryAuditStore::with_clock(clock.clone());
        let writer = AuditWriter::new(Arc::new(store.clone())).with_clock(clock.clone());
        (writer, store, clock)
    }

    fn submitted() -> NewAuditEntry {
        NewAuditEntry::new(
            AuditAction::DocumentSubmitted,
            AuditOrigin::PublicSubmission,
            AuditStatus::Success,
        )
    }

    fn admin() -> Principal {
        Principal::new("admin-1", Role::Admin).unwrap()
    }

    #[tokio::test]
    async fn test_record_persists_entry() {
        let (writer, store, _) = writer();
        let stored = writer.record(submitted().receiver("r-1")).await.unwrap();

        assert_eq!(stored.action, "document_submitted");
        assert_eq!(stored.status, "SUCCESS");
        assert_eq!(stored.created_at.timestamp(), NOW);
        assert_eq!(store.entries(), vec![stored.clone()]);
        assert_eq!(writer.find(stored.id).await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn test_record_failure_is_returned() {
        let (writer, store, _) = writer();
        store.set_failing(true);

        let err = writer.record(submitted()).await.unwrap_err();
        assert!(matches!(err, AuditError::Store(DbError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_record_best_effort_swallows_failure() {
        let (writer, store, _) = writer();
        store.set_failing(true);
        writer.record_best_effort(submitted()).await;
        store.set_failing(false);
        assert!(store.entries().is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_newest_first() {
        let (writer, _, clock) = writer();
        writer.record(submitted().receiver("a")).await.unwrap();
        clock.advance_secs(10);
        writer
            .record(NewAuditEntry::new(
                AuditAction::DocumentSubmitted,
                AuditOrigin::PublicSubmission,
                AuditStatus::UserNotFound,
            ))
            .await
            .unwrap();
        clock.advance_secs(10);
        writer.record(submitted().receiver("b")).await.unwrap();

        let filter = AuditLogFilter {
            status: Some(AuditStatus::Success),
            ..Default::default()
        };
        let entries = writer.list(&filter, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].receiver_identifier.as_deref(), Some("b"));
        assert_eq!(entries[1].receiver_identifier.as_deref(), Some("a"));

        assert_eq!(writer.list(&AuditLogFilter::default(), 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_requires_admin() {
        let (writer, store, clock) = writer();
        writer.record(submitted()).await.unwrap();
        clock.advance(Duration::days(DEFAULT_MIN_RETENTION_DAYS + 30));

        let issuer = Principal::new("issuer-1", Role::Issuer).unwrap();
        let err = writer
            .purge_before(&issuer, clock.now() - Duration::days(DEFAULT_MIN_RETENTION_DAYS))
            .await
            .unwrap_err();

        assert!(matches!(err, AuditError::NotAuthorized));
        // Original entry kept, denial recorded.
        let entries = store.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].status, "DENIED");
    }

    #[tokio::test]
    async fn test_purge_rejects_cutoff_inside_retention() {
        let (writer, store, clock) = writer();
        writer.record(submitted()).await.unwrap();

        let err = writer
            .purge_before(&admin(), clock.now() - Duration::days(365))
            .await
            .unwrap_err();

        assert!(matches!(err, AuditError::RetentionPeriod { .. }));
        assert_eq!(store.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_removes_expired_entries_and_records_itself() {
        let (writer, store, clock) = writer();
        writer.record(submitted().receiver("old")).await.unwrap();
        clock.advance(Duration::days(DEFAULT_MIN_RETENTION_DAYS + 1));
        writer.record(submitted().receiver("recent")).await.unwrap();

        let cutoff = clock.now() - Duration::days(DEFAULT_MIN_RETENTION_DAYS);
        let removed = writer.purge_before(&admin(), cutoff).await.unwrap();
        assert_eq!(removed, 1);

        let entries = store.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].receiver_identifier.as_deref(), Some("recent"));
        assert_eq!(entries[1].action, "retention_purge");
        assert_eq!(entries[1].metadata["removed"], 1);
    }

    #[tokio::test]
    async fn test_system_principal_cannot_purge() {
        let (writer, _, clock) = writer();
        clock.advance(Duration::days(DEFAULT_MIN_RETENTION_DAYS * 2));
        let err = writer
            .purge_before(&Principal::system(), clock.now() - Duration::days(DEFAULT_MIN_RETENTION_DAYS))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::NotAuthorized));
    }
}
