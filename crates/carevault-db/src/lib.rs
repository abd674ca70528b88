//! Database layer for CareVault.
//!
//! - [`context`]: binds a request's [`Principal`](carevault_core::Principal)
//!   to a database session so that row-level security policies filter by it,
//!   and guarantees the binding is cleared before the session is reused.
//! - [`audit`]: the append-only audit log and its retention workflow.
//! - [`memory`]: an in-process session pool that emulates the row-level
//!   policies, for tests and local development without Postgres.
//!
//! # Example
//!
//! ```rust,ignore
//! use carevault_db::{DbPool, TenantContextBroker, ContextOptions};
//!
//! let pool = DbPool::connect("postgres://localhost/carevault").await?;
//! let broker = TenantContextBroker::new(pool);
//! let rows = broker
//!     .run_with_context(Some(&principal), &ContextOptions::authenticated(), |conn| {
//!         Box::pin(async move { load_health_events(conn).await })
//!     })
//!     .await?;
//! ```

pub mod audit;
pub mod context;
pub mod error;
pub mod memory;
pub mod migrations;
pub mod pool;

pub use audit::{
    AuditAction, AuditError, AuditLogEntry, AuditLogFilter, AuditOrigin, AuditStatus, AuditStore,
    AuditWriter, MemoryAuditStore, NewAuditEntry, PgAuditStore, SharedAuditStore,
};
pub use context::{
    BindingError, ContextBinder, ContextError, ContextOptions, FallbackBinder, PrimaryBinder,
    SecuritySession, SessionPool, SessionVariables, TenantContextBroker,
};
pub use error::DbError;
pub use memory::{MemoryDatabase, MemoryRow, MemorySession, MemorySessionPool};
pub use migrations::run_migrations;
pub use pool::{DbPool, DbPoolConfig};
