//! Pipeline assembly.

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::response::Response;

use crate::request::PipelineRequest;
use crate::stage::{Endpoint, Next, Stage};
use crate::stages::{CircuitBreakerStage, IdentityStage, RateLimitStage};

/// An ordered stage chain ending at an endpoint.
///
/// Holds no per-request state; clones share the same stages.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<[Arc<dyn Stage>]>,
    endpoint: Arc<dyn Endpoint>,
    expose_internal_errors: bool,
}

impl Pipeline {
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Pipeline with an explicit stage order.
    #[must_use]
    pub fn from_stages(stages: Vec<Arc<dyn Stage>>, endpoint: Arc<dyn Endpoint>) -> Self {
        Self {
            stages: stages.into(),
            endpoint,
            expose_internal_errors: false,
        }
    }

    /// Include internal error details in responses. Development only.
    #[must_use]
    pub fn expose_internal_errors(mut self, expose: bool) -> Self {
        self.expose_internal_errors = expose;
        self
    }

    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run `req` through every stage and convert any rejection into its
    /// response.
    pub async fn execute(&self, req: PipelineRequest) -> Response {
        let request_id = req.request_id;
        let mut response = match Next::new(&self.stages, self.endpoint.as_ref()).run(req).await {
            Ok(response) => response,
            Err(err) => {
                let status = err.status_code();
                if status.is_server_error() {
                    tracing::error!(request_id = %request_id, error = %err, status = status.as_u16(), "Request failed");
                } else {
                    tracing::info!(request_id = %request_id, error = %err, status = status.as_u16(), "Request rejected");
                }
                err.to_response(self.expose_internal_errors)
            }
        };

        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("expose_internal_errors", &self.expose_internal_errors)
            .finish_non_exhaustive()
    }
}

/// Builds a [`Pipeline`] in the fixed order rate limit, circuit breaker,
/// identity, endpoint. Every stage is optional.
#[derive(Default)]
pub struct PipelineBuilder {
    rate_limit: Option<RateLimitStage>,
    circuit_breaker: Option<CircuitBreakerStage>,
    identity: Option<IdentityStage>,
    expose_internal_errors: bool,
}

impl PipelineBuilder {
    #[must_use]
    pub fn rate_limit(mut self, stage: RateLimitStage) -> Self {
        self.rate_limit = Some(stage);
        self
    }

    #[must_use]
    pub fn circuit_breaker(mut self, stage: CircuitBreakerStage) -> Self {
        self.circuit_breaker = Some(stage);
        self
    }

    #[must_use]
    pub fn identity(mut self, stage: IdentityStage) -> Self {
        self.identity = Some(stage);
        self
    }

    #[must_use]
    pub fn expose_internal_errors(mut self, expose: bool) -> Self {
        self.expose_internal_errors = expose;
        self
    }

    #[must_use]
    pub fn build(self, endpoint: impl Endpoint + 'static) -> Pipeline {
        let mut stages: Vec<Arc<dyn Stage>> = Vec::with_capacity(3);
        if let Some(stage) = self.rate_limit {
            stages.push(Arc::new(stage));
        }
        if let Some(stage) = self.circuit_breaker {
            stages.push(Arc::new(stage));
        }
        if let Some(stage) = self.identity {
            stages.push(Arc::new(stage));
        }
        Pipeline::from_stages(stages, Arc::new(endpoint))
            .expose_internal_errors(self.expose_internal_errors)
    }
}
