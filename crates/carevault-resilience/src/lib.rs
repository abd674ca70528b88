//! # carevault-resilience
//!
//! Protection for public endpoints and unreliable dependencies.
//!
//! - [`RateLimiter`]: per-key fixed-window counter with a hard lockout once
//!   the threshold is exceeded.
//! - [`CircuitBreaker`]: CLOSED / OPEN / HALF_OPEN state machine for one
//!   protected dependency.
//!
//! Both keep their state in a shared [`CounterStore`](carevault_store::CounterStore)
//! so that every service instance sees the same counters, and both **fail
//! open** when that store cannot be reached: the request is allowed and the
//! failure is logged.

pub mod circuit_breaker;
pub mod rate_limit;

pub use circuit_breaker::{
    BreakerDecision, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use rate_limit::{DenyReason, RateLimitConfig, RateLimitDecision, RateLimiter};

/// Default prefix for every key written to the counter store.
pub const DEFAULT_KEY_PREFIX: &str = "carevault";
