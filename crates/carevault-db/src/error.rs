//! Error types for the carevault-db crate.

use thiserror::Error;

/// Postgres SQLSTATE for an undefined function.
const UNDEFINED_FUNCTION: &str = "42883";

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to establish or acquire a database connection.
    #[error("Database connection failed: {0}")]
    ConnectionFailed(#[source] sqlx::Error),

    /// A database migration failed to apply.
    #[error("Migration failed: {0}")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),

    /// A database query failed to execute.
    #[error("Query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),

    /// A stored routine the query relies on is not installed.
    #[error("Database function not installed: {0}")]
    UndefinedFunction(String),

    /// The session or its backing store cannot serve requests.
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation failed.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl DbError {
    /// Classify a query error, singling out missing stored routines so the
    /// context binder can fall back.
    #[must_use]
    pub fn from_query(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some(UNDEFINED_FUNCTION) {
                return DbError::UndefinedFunction(db_err.message().to_string());
            }
        }
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DbError::ConnectionFailed(err)
            }
            other => DbError::QueryFailed(other),
        }
    }

    /// Check if this error indicates a connection problem.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, DbError::ConnectionFailed(_) | DbError::Unavailable(_))
    }

    #[must_use]
    pub fn is_undefined_function(&self) -> bool {
        matches!(self, DbError::UndefinedFunction(_))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }
}
