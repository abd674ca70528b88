//! # carevault-pipeline
//!
//! The request pipeline in front of every data-touching route:
//!
//! ```text
//! request -> RateLimitStage -> CircuitBreakerStage -> IdentityStage
//!         -> ProtectedEndpoint (TenantContextBroker::run_with_context -> BusinessHandler)
//!          | ScopedEndpoint (SessionScope::run per step -> ScopedHandler)
//! ```
//!
//! The request body is read only after the last stage lets the request
//! through.
//!
//! Stages implement [`Stage`] and continue through [`Next`]. Rejections are
//! [`PipelineError`]s, turned into JSON responses with the matching status
//! code (429, 503, 401, 403, 408, 500) by [`Pipeline::execute`].
//!
//! [`PipelineService`] mounts a pipeline on an axum router.

pub mod endpoint;
pub mod error;
pub mod identity;
pub mod pipeline;
pub mod request;
pub mod service;
pub mod stage;
pub mod stages;

pub use endpoint::{BusinessHandler, ProtectedEndpoint, ScopedEndpoint, ScopedHandler, SessionScope};
pub use error::{BreakerOutcome, ErrorResponse, HandlerError, PipelineError};
pub use identity::{AccessClaims, IdentityError, IdentityResolver, JwtIdentityResolver, ValidationConfig};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use request::{extract_client_ip, PipelineRequest};
pub use service::{PipelineService, DEFAULT_MAX_BODY_BYTES};
pub use stage::{Endpoint, Next, Stage};
pub use stages::{CircuitBreakerStage, IdentityStage, RateLimitStage};
