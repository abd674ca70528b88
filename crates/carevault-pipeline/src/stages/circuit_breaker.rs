//! Circuit breaking around the protected dependency.

use async_trait::async_trait;
use axum::response::Response;
use carevault_resilience::{BreakerDecision, CircuitBreaker};

use crate::error::{BreakerOutcome, PipelineError};
use crate::request::PipelineRequest;
use crate::stage::{Next, Stage};

/// Fails fast while the breaker is open and feeds outcomes back into it.
///
/// Errors that never reached the dependency (authentication, authorization)
/// are not recorded.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStage {
    breaker: CircuitBreaker,
}

impl CircuitBreakerStage {
    #[must_use]
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }
}

#[async_trait]
impl Stage for CircuitBreakerStage {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn handle(
        &self,
        req: PipelineRequest,
        next: Next<'_>,
    ) -> Result<Response, PipelineError> {
        let trial = match self.breaker.check().await {
            BreakerDecision::Allowed { trial } => trial,
            BreakerDecision::Rejected { retry_after_secs } => {
                tracing::debug!(
                    target: "circuit_breaker",
                    breaker = %self.breaker.name(),
                    retry_after_secs,
                    "Request rejected, circuit open"
                );
                return Err(PipelineError::CircuitOpen { retry_after_secs });
            }
        };

        let result = next.run(req).await;
        let outcome = match &result {
            Ok(_) => BreakerOutcome::Success,
            Err(err) => err.breaker_outcome(),
        };

        match outcome {
            BreakerOutcome::Success => self.breaker.record_success().await,
            BreakerOutcome::Failure => self.breaker.record_failure().await,
            BreakerOutcome::Neutral => {
                if trial {
                    // The trial slot expires on its own and admits a new trial call.
                    tracing::debug!(
                        target: "circuit_breaker",
                        breaker = %self.breaker.name(),
                        "Half-open trial ended without reaching the dependency"
                    );
                }
            }
        }
        result
    }
}
