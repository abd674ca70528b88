//! Append-only audit log.
//!
//! Entries are written through [`AuditWriter`] and never updated. The
//! database backs this with a trigger that rejects `UPDATE` outright and
//! `DELETE` unless the retention purge flag is set in the transaction.

mod model;
mod store;
mod writer;

pub use model::{
    hash_identifier, AuditAction, AuditLogEntry, AuditLogFilter, AuditOrigin, AuditStatus,
    NewAuditEntry,
};
pub use store::{AuditStore, MemoryAuditStore, PgAuditStore, SharedAuditStore};
pub use writer::{AuditError, AuditWriter, DEFAULT_MIN_RETENTION_DAYS, MAX_LIST_LIMIT};
