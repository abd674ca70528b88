//! Per-IP rate limiting in front of public routes.

use async_trait::async_trait;
use axum::http::HeaderValue;
use axum::response::Response;
use carevault_db::{AuditAction, AuditOrigin, AuditStatus, AuditWriter, NewAuditEntry};
use carevault_resilience::{DenyReason, RateLimitDecision, RateLimiter};

use crate::error::PipelineError;
use crate::request::PipelineRequest;
use crate::stage::{Next, Stage};

/// Rejects requests from client IPs over their quota.
#[derive(Debug, Clone)]
pub struct RateLimitStage {
    limiter: RateLimiter,
    audit: Option<AuditWriter>,
}

impl RateLimitStage {
    #[must_use]
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            limiter,
            audit: None,
        }
    }

    /// Record lockouts in the audit log.
    ///
    /// Only the request that trips the threshold is recorded. Requests
    /// rejected while the lockout is live are logged but not audited.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditWriter) -> Self {
        self.audit = Some(audit);
        self
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(
        &self,
        req: PipelineRequest,
        next: Next<'_>,
    ) -> Result<Response, PipelineError> {
        let Some(ip) = req.client_ip else {
            tracing::warn!(
                target: "rate_limit",
                request_id = %req.request_id,
                "No client IP, request not rate limited"
            );
            return next.run(req).await;
        };
        let key = ip.to_string();

        match self.limiter.check_and_increment(&key).await {
            RateLimitDecision::Allowed { remaining } => {
                let mut response = next.run(req).await?;
                let headers = response.headers_mut();
                headers.insert(
                    "X-RateLimit-Limit",
                    HeaderValue::from(self.limiter.config().max_requests),
                );
                if let Some(remaining) = remaining {
                    headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
                }
                Ok(response)
            }
            RateLimitDecision::Denied {
                retry_after_secs,
                reason,
            } => {
                tracing::warn!(
                    target: "rate_limit",
                    ip = %key,
                    reason = ?reason,
                    retry_after_secs,
                    path = %req.uri.path(),
                    "Request rejected by rate limiter"
                );
                if let (Some(audit), DenyReason::ThresholdExceeded) = (&self.audit, reason) {
                    let entry = NewAuditEntry::new(
                        AuditAction::RateLimited,
                        AuditOrigin::PublicSubmission,
                        AuditStatus::RateLimited,
                    )
                    .client(Some(key), req.user_agent().map(str::to_string))
                    .with_metadata("path", req.uri.path())
                    .with_metadata("retry_after_secs", retry_after_secs)
                    .with_metadata("request_id", req.request_id.to_string());
                    audit.record_best_effort(entry).await;
                }
                Err(PipelineError::RateLimited { retry_after_secs })
            }
        }
    }
}
