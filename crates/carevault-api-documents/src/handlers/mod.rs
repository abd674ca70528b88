//! Handlers behind the tenant context broker.

mod admin;
mod list;
mod submit;

pub use admin::{BreakerStatusHandler, ListAuditHandler, PurgeAuditHandler};
pub use list::ListDocumentsHandler;
pub use submit::{SubmitDocumentHandler, DEFAULT_MAX_DOCUMENT_BYTES};

use carevault_db::{AuditError, DbError};
use carevault_pipeline::HandlerError;

pub(crate) fn dependency(err: DbError) -> HandlerError {
    HandlerError::Dependency(err.to_string())
}

pub(crate) fn audit_failure(err: AuditError) -> HandlerError {
    match err {
        AuditError::NotAuthorized => HandlerError::Forbidden(err.to_string()),
        AuditError::RetentionPeriod { .. } => HandlerError::Validation(err.to_string()),
        AuditError::Store(_) => HandlerError::Internal(err.to_string()),
    }
}

/// Parse an optional `limit` query parameter, clamped to `1..=max`.
pub(crate) fn limit_param(
    req: &carevault_pipeline::PipelineRequest,
    default: i64,
    max: i64,
) -> Result<i64, HandlerError> {
    match req.query_param("limit") {
        None => Ok(default),
        Some(raw) => raw
            .parse::<i64>()
            .map(|limit| limit.clamp(1, max))
            .map_err(|_| HandlerError::Validation(format!("invalid limit: {raw}"))),
    }
}
