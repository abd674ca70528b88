//! Error types for counter store operations.

use thiserror::Error;

/// Errors returned by a [`CounterStore`](crate::CounterStore).
///
/// Callers in the resilience layer treat every variant as "store
/// unavailable" and fail open; the distinction only matters for logs.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached or the connection dropped.
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete within the configured timeout.
    #[error("Counter store operation timed out after {0} ms")]
    Timeout(u64),

    /// A stored value could not be interpreted (e.g. `incr` on a non-integer).
    #[error("Invalid value for key '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

impl StoreError {
    /// Whether the error indicates the store itself is unreachable.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            return StoreError::Timeout(0);
        }
        if err.kind() == redis::ErrorKind::TypeError {
            return StoreError::InvalidValue {
                key: String::new(),
                message: err.to_string(),
            };
        }
        StoreError::Unavailable(err.to_string())
    }
}
