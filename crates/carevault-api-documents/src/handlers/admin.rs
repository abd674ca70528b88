//! Administrator endpoints: audit log, retention purge, breaker status.
//!
//! None of these touch tenant data, so they authorize the caller without
//! checking out a database session.

use async_trait::async_trait;
use axum::response::{IntoResponse, Response};
use axum::Json;
use carevault_db::{AuditLogFilter, AuditWriter, SessionPool};
use carevault_pipeline::{HandlerError, PipelineError, PipelineRequest, ScopedHandler, SessionScope};
use carevault_resilience::CircuitBreaker;
use serde_json::json;

use super::{audit_failure, limit_param};
use crate::models::{PurgeRequest, PurgeResponse};

/// `GET /admin/audit`
#[derive(Debug, Clone)]
pub struct ListAuditHandler {
    audit: AuditWriter,
}

impl ListAuditHandler {
    #[must_use]
    pub fn new(audit: AuditWriter) -> Self {
        Self { audit }
    }
}

fn filter_from(req: &PipelineRequest) -> Result<AuditLogFilter, HandlerError> {
    let mut filter = AuditLogFilter::default();
    if let Some(action) = req.query_param("action") {
        filter.action = Some(action.parse().map_err(HandlerError::Validation)?);
    }
    if let Some(status) = req.query_param("status") {
        filter.status = Some(status.parse().map_err(HandlerError::Validation)?);
    }
    Ok(filter)
}

#[async_trait]
impl<P: SessionPool + 'static> ScopedHandler<P> for ListAuditHandler {
    async fn handle(
        &self,
        scope: &SessionScope<'_, P>,
        req: PipelineRequest,
    ) -> Result<Response, PipelineError> {
        scope.authorize().await?;
        let filter = filter_from(&req)?;
        let limit = limit_param(&req, 100, carevault_db::audit::MAX_LIST_LIMIT)?;
        let entries = self.audit.list(&filter, limit).await.map_err(audit_failure)?;
        Ok(Json(json!({ "entries": entries })).into_response())
    }
}

/// `POST /admin/audit/purge`
#[derive(Debug, Clone)]
pub struct PurgeAuditHandler {
    audit: AuditWriter,
}

impl PurgeAuditHandler {
    #[must_use]
    pub fn new(audit: AuditWriter) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl<P: SessionPool + 'static> ScopedHandler<P> for PurgeAuditHandler {
    async fn handle(
        &self,
        scope: &SessionScope<'_, P>,
        req: PipelineRequest,
    ) -> Result<Response, PipelineError> {
        let actor = scope.authorize().await?;
        let body: PurgeRequest = req.json()?;
        let removed = self
            .audit
            .purge_before(&actor, body.cutoff)
            .await
            .map_err(audit_failure)?;
        Ok(Json(PurgeResponse { removed }).into_response())
    }
}

/// `GET /admin/circuit-breakers`
#[derive(Debug, Clone)]
pub struct BreakerStatusHandler {
    breakers: Vec<CircuitBreaker>,
}

impl BreakerStatusHandler {
    #[must_use]
    pub fn new(breakers: Vec<CircuitBreaker>) -> Self {
        Self { breakers }
    }
}

#[async_trait]
impl<P: SessionPool + 'static> ScopedHandler<P> for BreakerStatusHandler {
    async fn handle(
        &self,
        scope: &SessionScope<'_, P>,
        _req: PipelineRequest,
    ) -> Result<Response, PipelineError> {
        scope.authorize().await?;
        let mut snapshots = Vec::with_capacity(self.breakers.len());
        for breaker in &self.breakers {
            let snapshot = breaker
                .status()
                .await
                .map_err(|e| HandlerError::Dependency(e.to_string()))?;
            snapshots.push(snapshot);
        }
        Ok(Json(json!({ "circuit_breakers": snapshots })).into_response())
    }
}
