//! Broker-wrapped handlers at the end of the pipeline.
//!
//! [`ProtectedEndpoint`] runs a [`BusinessHandler`] on one bound session for
//! the whole request. [`ScopedEndpoint`] hands a [`ScopedHandler`] a
//! [`SessionScope`] instead, so the handler decides which steps need a
//! bound session and keeps uploads and audit writes outside of it.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::response::Response;
use carevault_core::{Principal, RequestId};
use carevault_db::{
    AuditAction, AuditOrigin, AuditStatus, AuditWriter, ContextError, ContextOptions,
    NewAuditEntry, SessionPool, TenantContextBroker,
};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{HandlerError, PipelineError};
use crate::request::PipelineRequest;
use crate::stage::Endpoint;

/// Business logic running on a session bound to the request's principal.
///
/// Handlers never see an unbound session and never release it themselves.
#[async_trait]
pub trait BusinessHandler<S: Send>: Send + Sync {
    async fn handle(&self, session: &mut S, req: PipelineRequest)
        -> Result<Response, HandlerError>;
}

/// Business logic that checks out bound sessions step by step through a
/// [`SessionScope`].
#[async_trait]
pub trait ScopedHandler<P: SessionPool + 'static>: Send + Sync {
    async fn handle(
        &self,
        scope: &SessionScope<'_, P>,
        req: PipelineRequest,
    ) -> Result<Response, PipelineError>;
}

/// What a rejection audit entry needs to know about the request.
#[derive(Debug, Clone)]
struct RequestSummary {
    request_id: RequestId,
    path: String,
    client_ip: Option<IpAddr>,
    user_agent: Option<String>,
    principal: Option<Principal>,
}

impl RequestSummary {
    fn of(req: &PipelineRequest) -> Self {
        Self {
            request_id: req.request_id,
            path: req.uri.path().to_string(),
            client_ip: req.client_ip,
            user_agent: req.user_agent().map(str::to_string),
            principal: req.principal.clone(),
        }
    }
}

/// Access to bound sessions for a single request.
///
/// Every [`run`](Self::run) checks out a session, binds the request's
/// principal, runs the work and releases the session before returning.
/// Rejections by the broker are audited when an audit writer is attached.
pub struct SessionScope<'a, P: SessionPool> {
    broker: &'a TenantContextBroker<P>,
    options: &'a ContextOptions,
    audit: Option<&'a AuditWriter>,
    request: RequestSummary,
}

impl<P: SessionPool> SessionScope<'_, P> {
    /// The principal the request runs as, checked against the route's
    /// options. No session is checked out.
    pub async fn authorize(&self) -> Result<Principal, PipelineError> {
        match self
            .broker
            .authorize(self.request.principal.as_ref(), self.options)
        {
            Ok(principal) => Ok(principal),
            Err(err) => {
                let err = err.widen::<HandlerError>();
                self.audit_rejection(&err).await;
                Err(err.into())
            }
        }
    }

    /// Run `work` on a freshly bound session.
    pub async fn run<T, F>(&self, work: F) -> Result<T, PipelineError>
    where
        F: for<'c> FnOnce(&'c mut P::Session) -> BoxFuture<'c, Result<T, HandlerError>> + Send,
    {
        match self
            .broker
            .run_with_context(self.request.principal.as_ref(), self.options, work)
            .await
        {
            Ok(value) => Ok(value),
            Err(err) => {
                self.audit_rejection(&err).await;
                Err(err.into())
            }
        }
    }

    async fn audit_rejection(&self, err: &ContextError<HandlerError>) {
        let Some(audit) = self.audit else {
            return;
        };
        let (action, reason) = match err {
            ContextError::Unauthenticated => (AuditAction::AuthenticationFailed, "missing_token"),
            ContextError::Forbidden(_) => (AuditAction::AccessDenied, "role_not_permitted"),
            ContextError::Binding(_) => (AuditAction::ContextBindingFailed, "context_binding"),
            _ => return,
        };
        let origin = if self.options.system_mode {
            AuditOrigin::PublicSubmission
        } else {
            AuditOrigin::AuthenticatedApi
        };
        let request = &self.request;
        let mut entry = NewAuditEntry::new(action, origin, AuditStatus::Denied)
            .client(
                request.client_ip.map(|ip| ip.to_string()),
                request.user_agent.clone(),
            )
            .with_metadata("reason", reason)
            .with_metadata("path", request.path.as_str())
            .with_metadata("request_id", request.request_id.to_string());
        if let Some(principal) = &request.principal {
            entry = entry.actor(principal.id());
        }
        audit.record_best_effort(entry).await;
    }
}

impl<P: SessionPool> std::fmt::Debug for SessionScope<'_, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionScope")
            .field("options", self.options)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// Broker, route options and optional audit writer shared by both
/// endpoint kinds.
struct ContextRoute<P: SessionPool> {
    broker: TenantContextBroker<P>,
    options: ContextOptions,
    audit: Option<AuditWriter>,
}

impl<P: SessionPool> ContextRoute<P> {
    fn scope(&self, req: &PipelineRequest) -> SessionScope<'_, P> {
        SessionScope {
            broker: &self.broker,
            options: &self.options,
            audit: self.audit.as_ref(),
            request: RequestSummary::of(req),
        }
    }
}

/// Runs a [`BusinessHandler`] through [`TenantContextBroker::run_with_context`].
pub struct ProtectedEndpoint<P: SessionPool, H> {
    route: ContextRoute<P>,
    handler: Arc<H>,
}

impl<P, H> ProtectedEndpoint<P, H>
where
    P: SessionPool,
    H: BusinessHandler<P::Session> + 'static,
{
    #[must_use]
    pub fn new(broker: TenantContextBroker<P>, options: ContextOptions, handler: H) -> Self {
        Self {
            route: ContextRoute {
                broker,
                options,
                audit: None,
            },
            handler: Arc::new(handler),
        }
    }

    /// Record authentication and authorization failures in the audit log.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditWriter) -> Self {
        self.route.audit = Some(audit);
        self
    }
}

#[async_trait]
impl<P, H> Endpoint for ProtectedEndpoint<P, H>
where
    P: SessionPool,
    H: BusinessHandler<P::Session> + 'static,
{
    async fn call(&self, req: PipelineRequest) -> Result<Response, PipelineError> {
        let scope = self.route.scope(&req);
        let handler = Arc::clone(&self.handler);
        scope
            .run(move |session| async move { handler.handle(session, req).await }.boxed())
            .await
    }
}

impl<P: SessionPool + std::fmt::Debug, H> std::fmt::Debug for ProtectedEndpoint<P, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedEndpoint")
            .field("broker", &self.route.broker)
            .field("options", &self.route.options)
            .finish_non_exhaustive()
    }
}

/// Runs a [`ScopedHandler`] with a [`SessionScope`] for the request.
pub struct ScopedEndpoint<P: SessionPool, H> {
    route: ContextRoute<P>,
    handler: H,
}

impl<P, H> ScopedEndpoint<P, H>
where
    P: SessionPool + 'static,
    H: ScopedHandler<P>,
{
    #[must_use]
    pub fn new(broker: TenantContextBroker<P>, options: ContextOptions, handler: H) -> Self {
        Self {
            route: ContextRoute {
                broker,
                options,
                audit: None,
            },
            handler,
        }
    }

    /// Record authentication and authorization failures in the audit log.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditWriter) -> Self {
        self.route.audit = Some(audit);
        self
    }
}

#[async_trait]
impl<P, H> Endpoint for ScopedEndpoint<P, H>
where
    P: SessionPool + 'static,
    H: ScopedHandler<P>,
{
    async fn call(&self, req: PipelineRequest) -> Result<Response, PipelineError> {
        let scope = self.route.scope(&req);
        self.handler.handle(&scope, req).await
    }
}

impl<P: SessionPool + std::fmt::Debug, H> std::fmt::Debug for ScopedEndpoint<P, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedEndpoint")
            .field("broker", &self.route.broker)
            .field("options", &self.route.options)
            .finish_non_exhaustive()
    }
}
