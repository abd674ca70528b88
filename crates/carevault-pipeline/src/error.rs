//! Error types for the request pipeline.
//!
//! Every rejection leaves the pipeline as a JSON body
//! `{"error": code, "message": text, "retry_after_seconds"?: n}`.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use carevault_db::ContextError;
use serde::Serialize;
use thiserror::Error;

/// Errors a business handler may return.
///
/// Only [`HandlerError::Dependency`] counts as a failure of the protected
/// dependency for circuit breaking.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Forbidden(String),

    /// A dependent store failed.
    #[error("dependency failure: {0}")]
    Dependency(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Pipeline errors, one per rejection the pipeline can produce.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Too many requests")]
    RateLimited { retry_after_secs: u64 },

    #[error("Service temporarily unavailable")]
    CircuitOpen { retry_after_secs: u64 },

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Access denied")]
    Forbidden,

    /// The security context could not be bound; surfaced as an
    /// authorization failure.
    #[error("Access denied")]
    ContextBinding(String),

    #[error("Request timed out")]
    Timeout,

    /// No database session could be obtained.
    #[error("Database unavailable: {0}")]
    SessionUnavailable(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How an outcome affects the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerOutcome {
    /// The dependency answered.
    Success,
    /// The dependency failed or did not answer in time.
    Failure,
    /// The request never reached the dependency.
    Neutral,
}

impl PipelineError {
    /// Get the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::CircuitOpen { .. }
            | PipelineError::SessionUnavailable(_)
            | PipelineError::Handler(HandlerError::Dependency(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PipelineError::Unauthenticated => StatusCode::UNAUTHORIZED,
            PipelineError::Forbidden
            | PipelineError::ContextBinding(_)
            | PipelineError::Handler(HandlerError::Forbidden(_)) => StatusCode::FORBIDDEN,
            PipelineError::Timeout => StatusCode::REQUEST_TIMEOUT,
            PipelineError::BadRequest(_) | PipelineError::Handler(HandlerError::Validation(_)) => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::Handler(HandlerError::NotFound(_)) => StatusCode::NOT_FOUND,
            PipelineError::Handler(HandlerError::Internal(_)) | PipelineError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code string for JSON response.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            PipelineError::RateLimited { .. } => "rate_limited",
            PipelineError::CircuitOpen { .. } => "circuit_open",
            PipelineError::Unauthenticated => "unauthorized",
            PipelineError::Forbidden
            | PipelineError::ContextBinding(_)
            | PipelineError::Handler(HandlerError::Forbidden(_)) => "forbidden",
            PipelineError::Timeout => "request_timeout",
            PipelineError::SessionUnavailable(_) => "service_unavailable",
            PipelineError::BadRequest(_) => "bad_request",
            PipelineError::Handler(HandlerError::NotFound(_)) => "not_found",
            PipelineError::Handler(HandlerError::Validation(_)) => "validation_error",
            PipelineError::Handler(HandlerError::Dependency(_)) => "dependency_unavailable",
            PipelineError::Handler(HandlerError::Internal(_)) | PipelineError::Internal(_) => {
                "internal_error"
            }
        }
    }

    /// Seconds the client should wait before retrying, if any.
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            PipelineError::RateLimited { retry_after_secs }
            | PipelineError::CircuitOpen { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Classify this error for the circuit breaker.
    #[must_use]
    pub fn breaker_outcome(&self) -> BreakerOutcome {
        match self {
            PipelineError::Timeout
            | PipelineError::SessionUnavailable(_)
            | PipelineError::Handler(HandlerError::Dependency(_)) => BreakerOutcome::Failure,
            PipelineError::Handler(
                HandlerError::NotFound(_) | HandlerError::Validation(_) | HandlerError::Forbidden(_),
            ) => BreakerOutcome::Success,
            _ => BreakerOutcome::Neutral,
        }
    }

    /// Message safe to show a client. Details of server-side failures are
    /// only included when `expose_internal` is set.
    #[must_use]
    pub fn public_message(&self, expose_internal: bool) -> String {
        match self {
            PipelineError::SessionUnavailable(_) if !expose_internal => {
                "Service temporarily unavailable".to_string()
            }
            PipelineError::Handler(HandlerError::Dependency(_)) if !expose_internal => {
                "Service temporarily unavailable".to_string()
            }
            PipelineError::Handler(HandlerError::Internal(_)) | PipelineError::Internal(_)
                if !expose_internal =>
            {
                "Internal server error".to_string()
            }
            // Binding details never leave the server.
            PipelineError::ContextBinding(_) => "Access denied".to_string(),
            other => other.to_string(),
        }
    }

    /// Build the HTTP response.
    #[must_use]
    pub fn to_response(&self, expose_internal: bool) -> Response {
        let body = ErrorResponse {
            error: self.error_code().to_string(),
            message: self.public_message(expose_internal),
            retry_after_seconds: self.retry_after_secs(),
        };
        let mut response = (self.status_code(), axum::Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<ContextError<HandlerError>> for PipelineError {
    fn from(err: ContextError<HandlerError>) -> Self {
        match err {
            ContextError::Unauthenticated => PipelineError::Unauthenticated,
            ContextError::Forbidden(_) => PipelineError::Forbidden,
            ContextError::Binding(err) => PipelineError::ContextBinding(err.to_string()),
            ContextError::Session(err) => PipelineError::SessionUnavailable(err.to_string()),
            ContextError::Timeout(_) => PipelineError::Timeout,
            ContextError::Handler(err) => PipelineError::Handler(err),
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        self.to_response(false)
    }
}

/// Structured JSON error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "rate_limited", "forbidden")
    pub error: String,
    /// Human-readable error message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}
