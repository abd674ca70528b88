//! Built-in pipeline stages, in the order the pipeline runs them.

mod circuit_breaker;
mod identity;
mod rate_limit;

pub use circuit_breaker::CircuitBreakerStage;
pub use identity::IdentityStage;
pub use rate_limit::RateLimitStage;
