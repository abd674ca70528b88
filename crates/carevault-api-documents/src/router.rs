//! Router configuration for the documents API.

use std::sync::Arc;

use axum::routing::{get, get_service, post_service};
use axum::{Json, Router};
use carevault_core::{Role, SharedClock, SystemClock};
use carevault_db::{AuditWriter, ContextOptions, SessionPool, TenantContextBroker};
use carevault_pipeline::{
    BusinessHandler, CircuitBreakerStage, Endpoint, IdentityResolver, IdentityStage, Pipeline,
    PipelineService, ProtectedEndpoint, RateLimitStage, ScopedEndpoint, ScopedHandler,
};
use carevault_resilience::{CircuitBreaker, CircuitBreakerConfig, RateLimitConfig, RateLimiter};
use carevault_store::SharedCounterStore;
use serde_json::json;

use crate::handlers::{
    BreakerStatusHandler, ListAuditHandler, ListDocumentsHandler, PurgeAuditHandler,
    SubmitDocumentHandler,
};
use crate::repository::DocumentRepository;
use crate::storage::DocumentStorage;

/// Rate limit scope of the public submission endpoint.
pub const SUBMISSION_SCOPE: &str = "document_submission";

/// Name of the breaker guarding the document store.
pub const DOCUMENT_STORE_BREAKER: &str = "document_store";

/// Tunables for the documents API.
#[derive(Debug, Clone)]
pub struct DocumentsApiConfig {
    pub submission_rate_limit: RateLimitConfig,
    pub document_store_breaker: CircuitBreakerConfig,
    pub max_document_bytes: usize,
    pub max_body_bytes: usize,
    pub expose_internal_errors: bool,
    pub trust_forwarded_headers: bool,
}

impl Default for DocumentsApiConfig {
    fn default() -> Self {
        Self {
            submission_rate_limit: RateLimitConfig::for_scope(SUBMISSION_SCOPE),
            document_store_breaker: CircuitBreakerConfig::named(DOCUMENT_STORE_BREAKER),
            max_document_bytes: crate::handlers::DEFAULT_MAX_DOCUMENT_BYTES,
            max_body_bytes: carevault_pipeline::DEFAULT_MAX_BODY_BYTES,
            expose_internal_errors: false,
            trust_forwarded_headers: false,
        }
    }
}

/// Everything the documents routes depend on.
#[derive(Clone)]
pub struct DocumentsApi<P> {
    pub broker: TenantContextBroker<P>,
    pub counters: SharedCounterStore,
    pub audit: AuditWriter,
    pub storage: Arc<dyn DocumentStorage>,
    pub identity: Arc<dyn IdentityResolver>,
    pub clock: SharedClock,
    pub config: DocumentsApiConfig,
}

impl<P> DocumentsApi<P>
where
    P: SessionPool + Clone + 'static,
    P::Session: DocumentRepository,
{
    #[must_use]
    pub fn new(
        broker: TenantContextBroker<P>,
        counters: SharedCounterStore,
        audit: AuditWriter,
        storage: Arc<dyn DocumentStorage>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            broker,
            counters,
            audit,
            storage,
            identity,
            clock: SystemClock::shared(),
            config: DocumentsApiConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: DocumentsApiConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn document_store_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::with_clock(
            self.config.document_store_breaker.clone(),
            self.counters.clone(),
            self.clock.clone(),
        )
    }

    fn service(&self, pipeline: Pipeline) -> PipelineService {
        PipelineService::new(pipeline)
            .with_max_body_bytes(self.config.max_body_bytes)
            .trust_forwarded_headers(self.config.trust_forwarded_headers)
    }

    fn endpoint<H>(&self, options: ContextOptions, handler: H) -> ProtectedEndpoint<P, H>
    where
        H: BusinessHandler<P::Session> + 'static,
    {
        ProtectedEndpoint::new(self.broker.clone(), options, handler).with_audit(self.audit.clone())
    }

    fn scoped<H>(&self, options: ContextOptions, handler: H) -> ScopedEndpoint<P, H>
    where
        H: ScopedHandler<P> + 'static,
    {
        ScopedEndpoint::new(self.broker.clone(), options, handler).with_audit(self.audit.clone())
    }

    /// Identity plus broker, for authenticated routes.
    fn authenticated(&self, endpoint: impl Endpoint + 'static) -> PipelineService {
        let pipeline = Pipeline::builder()
            .identity(IdentityStage::new(self.identity.clone()).with_audit(self.audit.clone()))
            .expose_internal_errors(self.config.expose_internal_errors)
            .build(endpoint);
        self.service(pipeline)
    }

    /// Public submission: rate limit, breaker, system-mode broker.
    fn submission(&self) -> PipelineService {
        let limiter = RateLimiter::with_clock(
            self.config.submission_rate_limit.clone(),
            self.counters.clone(),
            self.clock.clone(),
        );
        let handler = SubmitDocumentHandler::new(self.storage.clone(), self.audit.clone())
            .with_max_document_bytes(self.config.max_document_bytes);

        let pipeline = Pipeline::builder()
            .rate_limit(RateLimitStage::new(limiter).with_audit(self.audit.clone()))
            .circuit_breaker(CircuitBreakerStage::new(self.document_store_breaker()))
            .expose_internal_errors(self.config.expose_internal_errors)
            .build(self.scoped(ContextOptions::system(), handler));
        self.service(pipeline)
    }
}

/// Create the documents router.
///
/// Provides:
/// - POST /public/documents - Submit a document for a receiver (rate limited: 10 req/IP/hour)
/// - GET /documents - List the caller's documents
/// - GET /admin/audit - Query the audit log (admin)
/// - POST /admin/audit/purge - Retention purge (admin)
/// - GET /admin/circuit-breakers - Breaker status (admin)
/// - GET /health - Liveness
pub fn documents_router<P>(api: DocumentsApi<P>) -> Router
where
    P: SessionPool + Clone + 'static,
    P::Session: DocumentRepository,
{
    let admin = || ContextOptions::authenticated().require_roles([Role::Admin]);

    Router::new()
        .route("/public/documents", post_service(api.submission()))
        .route(
            "/documents",
            get_service(api.authenticated(
                api.endpoint(ContextOptions::authenticated(), ListDocumentsHandler),
            )),
        )
        .route(
            "/admin/audit",
            get_service(api.authenticated(
                api.scoped(admin(), ListAuditHandler::new(api.audit.clone())),
            )),
        )
        .route(
            "/admin/audit/purge",
            post_service(api.authenticated(
                api.scoped(admin(), PurgeAuditHandler::new(api.audit.clone())),
            )),
        )
        .route(
            "/admin/circuit-breakers",
            get_service(api.authenticated(api.scoped(
                admin(),
                BreakerStatusHandler::new(vec![api.document_store_breaker()]),
            ))),
        )
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
}
