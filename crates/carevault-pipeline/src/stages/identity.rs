//! Bearer token resolution.

use std::sync::Arc;

use async_trait::async_trait;
use axum::response::Response;
use carevault_db::{AuditAction, AuditOrigin, AuditStatus, AuditWriter, NewAuditEntry};

use crate::error::PipelineError;
use crate::identity::IdentityResolver;
use crate::request::PipelineRequest;
use crate::stage::{Next, Stage};

/// Resolves the bearer token, if any, into the request's principal.
///
/// A missing token leaves the request anonymous; whether that is allowed
/// is decided by the route's context options. A presented but invalid
/// token is rejected with 401.
#[derive(Clone)]
pub struct IdentityStage {
    resolver: Arc<dyn IdentityResolver>,
    audit: Option<AuditWriter>,
}

impl IdentityStage {
    #[must_use]
    pub fn new(resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            resolver,
            audit: None,
        }
    }

    /// Record rejected bearer tokens in the audit log.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditWriter) -> Self {
        self.audit = Some(audit);
        self
    }

    async fn audit_rejection(&self, req: &PipelineRequest) {
        let Some(audit) = &self.audit else {
            return;
        };
        let entry = NewAuditEntry::new(
            AuditAction::AuthenticationFailed,
            AuditOrigin::AuthenticatedApi,
            AuditStatus::Denied,
        )
        .client(
            req.client_ip.map(|ip| ip.to_string()),
            req.user_agent().map(str::to_string),
        )
        .with_metadata("reason", "invalid_token")
        .with_metadata("path", req.uri.path())
        .with_metadata("request_id", req.request_id.to_string());
        audit.record_best_effort(entry).await;
    }
}

impl std::fmt::Debug for IdentityStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for IdentityStage {
    fn name(&self) -> &'static str {
        "identity"
    }

    async fn handle(
        &self,
        mut req: PipelineRequest,
        next: Next<'_>,
    ) -> Result<Response, PipelineError> {
        if let Some(token) = req.bearer_token() {
            match self.resolver.resolve(token).await {
                Ok(principal) => {
                    tracing::debug!(
                        request_id = %req.request_id,
                        principal = %principal,
                        "Identity resolved"
                    );
                    req.principal = Some(principal);
                }
                Err(err) => {
                    tracing::info!(
                        request_id = %req.request_id,
                        error = %err,
                        "Bearer token rejected"
                    );
                    self.audit_rejection(&req).await;
                    return Err(PipelineError::Unauthenticated);
                }
            }
        }
        next.run(req).await
    }
}
