//! Distributed circuit breaker for dependent stores.
//!
//! Breaker state lives in the counter store so that every instance of the
//! service sees the same status for a protected dependency. The transition
//! from Open to `HalfOpen` is evaluated lazily on the next [`CircuitBreaker::check`]
//! once the cooldown has elapsed; there is no timer.
//!
//! If the counter store is unreachable the breaker fails open and logs under
//! the `circuit_breaker` target.

use carevault_core::{SharedClock, SystemClock};
use carevault_store::{SharedCounterStore, StoreError};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::DEFAULT_KEY_PREFIX;

/// Retry hint while a half-open trial is already in flight.
const TRIAL_IN_FLIGHT_RETRY_SECS: u64 = 5;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls proceed.
    #[default]
    Closed,
    /// Circuit tripped - calls rejected immediately.
    Open,
    /// Testing recovery - a bounded number of trial calls.
    HalfOpen,
}

impl CircuitState {
    /// Stored string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Parse the stored string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(Self::Closed),
            "open" => Some(Self::Open),
            "half_open" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name of the protected dependency; part of every store key.
    pub name: String,
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Time spent Open before a trial call is allowed.
    pub cooldown: Duration,
    /// Trial calls admitted while `HalfOpen`.
    pub half_open_max_trials: u32,
    /// A claimed trial slot is released after this long if its outcome
    /// is never reported.
    pub trial_timeout: Duration,
    /// Prefix for counter store keys.
    pub key_prefix: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            cooldown: Duration::from_secs(900),
            half_open_max_trials: 1,
            trial_timeout: Duration::from_secs(60),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Default configuration for the named dependency.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    #[must_use]
    pub fn with_half_open_max_trials(mut self, trials: u32) -> Self {
        self.half_open_max_trials = trials.max(1);
        self
    }

    #[must_use]
    pub fn with_trial_timeout(mut self, timeout: Duration) -> Self {
        self.trial_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:cb:{}:{}", self.key_prefix, self.name, suffix)
    }
}

/// Outcome of [`CircuitBreaker::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// The call may proceed. `trial` is set when it is a half-open trial call.
    Allowed { trial: bool },
    /// The circuit is open.
    Rejected { retry_after_secs: u64 },
}

impl BreakerDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, BreakerDecision::Allowed { .. })
    }
}

/// Status information for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u64,
    pub last_transition_at: Option<DateTime<Utc>>,
}

/// Circuit breaker for one named dependency.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    store: SharedCounterStore,
    clock: SharedClock,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig, store: SharedCounterStore) -> Self {
        Self::with_clock(config, store, SystemClock::shared())
    }

    #[must_use]
    pub fn with_clock(
        config: CircuitBreakerConfig,
        store: SharedCounterStore,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    /// Name of the protected dependency.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Decide whether a call to the dependency may proceed.
    ///
    /// Handles the lazy Open to `HalfOpen` transition and claims a trial
    /// slot while half-open.
    pub async fn check(&self) -> BreakerDecision {
        match self.try_check().await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(
                    target: "circuit_breaker",
                    breaker = %self.config.name,
                    error = %err,
                    "Counter store unavailable, circuit breaker failing open"
                );
                BreakerDecision::Allowed { trial: false }
            }
        }
    }

    /// Record a successful call.
    ///
    /// Closes the circuit after a successful trial and resets the
    /// consecutive failure count while closed.
    pub async fn record_success(&self) {
        if let Err(err) = self.try_record_success().await {
            self.log_record_error("success", &err);
        }
    }

    /// Record a failed call.
    ///
    /// Opens the circuit once the threshold is reached, or reopens it after
    /// a failed trial.
    pub async fn record_failure(&self) {
        if let Err(err) = self.try_record_failure().await {
            self.log_record_error("failure", &err);
        }
    }

    /// Current breaker state for diagnostics.
    pub async fn status(&self) -> Result<BreakerSnapshot, StoreError> {
        let state = self.read_state().await?;
        let failure_count = self
            .store
            .get(&self.config.key("failures"))
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let last_transition_at = self
            .read_transitioned_at()
            .await?
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        Ok(BreakerSnapshot {
            name: self.config.name.clone(),
            state,
            failure_count,
            last_transition_at,
        })
    }

    async fn try_check(&self) -> Result<BreakerDecision, StoreError> {
        match self.read_state().await? {
            CircuitState::Closed => Ok(BreakerDecision::Allowed { trial: false }),
            CircuitState::HalfOpen => self.claim_trial().await,
            CircuitState::Open => {
                let now = self.clock.now_secs();
                let cooldown = self.cooldown_secs();
                let opened_at = self.read_transitioned_at().await?;
                let elapsed = opened_at.map(|at| now.saturating_sub(at));

                match elapsed {
                    Some(elapsed) if elapsed < cooldown => Ok(BreakerDecision::Rejected {
                        retry_after_secs: u64::try_from(cooldown - elapsed).unwrap_or(1).max(1),
                    }),
                    _ => {
                        // The trial key is derived from the Open timestamp, which
                        // stays unchanged through HalfOpen.
                        self.store
                            .set(
                                &self.config.key("status"),
                                CircuitState::HalfOpen.as_str(),
                                None,
                            )
                            .await?;
                        tracing::info!(
                            target: "circuit_breaker",
                            breaker = %self.config.name,
                            opened_at = ?opened_at,
                            "Circuit breaker transitioning to half-open for trial"
                        );
                        self.claim_trial().await
                    }
                }
            }
        }
    }

    async fn claim_trial(&self) -> Result<BreakerDecision, StoreError> {
        let opened_at = self.read_transitioned_at().await?.unwrap_or(0);
        let trial_key = self.config.key(&format!("trial:{opened_at}"));

        let claimed = self.store.incr(&trial_key).await?;
        if claimed == 1 {
            self.store
                .expire(&trial_key, self.config.trial_timeout.as_secs().max(1))
                .await?;
        }

        if claimed <= i64::from(self.config.half_open_max_trials) {
            tracing::debug!(
                target: "circuit_breaker",
                breaker = %self.config.name,
                trial = claimed,
                "Half-open trial admitted"
            );
            Ok(BreakerDecision::Allowed { trial: true })
        } else {
            Ok(BreakerDecision::Rejected {
                retry_after_secs: TRIAL_IN_FLIGHT_RETRY_SECS,
            })
        }
    }

    async fn try_record_success(&self) -> Result<(), StoreError> {
        match self.read_state().await? {
            CircuitState::HalfOpen => {
                self.transition(CircuitState::Closed).await?;
                tracing::info!(
                    target: "circuit_breaker",
                    breaker = %self.config.name,
                    "Circuit breaker closed after successful trial"
                );
            }
            CircuitState::Closed => {
                let failures_key = self.config.key("failures");
                if self.store.get(&failures_key).await?.is_some() {
                    self.store.del(&failures_key).await?;
                }
            }
            CircuitState::Open => {
                tracing::warn!(
                    target: "circuit_breaker",
                    breaker = %self.config.name,
                    "Unexpected success recorded while circuit is open"
                );
            }
        }
        Ok(())
    }

    async fn try_record_failure(&self) -> Result<(), StoreError> {
        match self.read_state().await? {
            CircuitState::Closed => {
                let failures = self.store.incr(&self.config.key("failures")).await?;
                if failures >= i64::from(self.config.failure_threshold) {
                    self.transition(CircuitState::Open).await?;
                    tracing::warn!(
                        target: "circuit_breaker",
                        breaker = %self.config.name,
                        failure_count = failures,
                        threshold = self.config.failure_threshold,
                        opened_at = self.clock.now_secs(),
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.transition(CircuitState::Open).await?;
                tracing::warn!(
                    target: "circuit_breaker",
                    breaker = %self.config.name,
                    opened_at = self.clock.now_secs(),
                    "Circuit breaker reopened after failed trial"
                );
            }
            CircuitState::Open => {}
        }
        Ok(())
    }

    /// Persist a transition. The timestamp is written before the status so
    /// that a reader never sees a fresh status with a stale timestamp.
    async fn transition(&self, to: CircuitState) -> Result<(), StoreError> {
        let now = self.clock.now_secs();
        if to == CircuitState::Closed {
            self.store.del(&self.config.key("failures")).await?;
        }
        self.store
            .set(&self.config.key("transitioned_at"), &now.to_string(), None)
            .await?;
        self.store
            .set(&self.config.key("status"), to.as_str(), None)
            .await
    }

    async fn read_state(&self) -> Result<CircuitState, StoreError> {
        let raw = self.store.get(&self.config.key("status")).await?;
        Ok(match raw {
            None => CircuitState::Closed,
            Some(raw) => CircuitState::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(
                    target: "circuit_breaker",
                    breaker = %self.config.name,
                    value = %raw,
                    "Unknown stored circuit state, treating as closed"
                );
                CircuitState::Closed
            }),
        })
    }

    async fn read_transitioned_at(&self) -> Result<Option<i64>, StoreError> {
        Ok(self
            .store
            .get(&self.config.key("transitioned_at"))
            .await?
            .and_then(|v| v.parse::<i64>().ok()))
    }

    fn cooldown_secs(&self) -> i64 {
        i64::try_from(self.config.cooldown.as_secs()).unwrap_or(i64::MAX)
    }

    fn log_record_error(&self, outcome: &'static str, err: &StoreError) {
        tracing::warn!(
            target: "circuit_breaker",
            breaker = %self.config.name,
            outcome,
            error = %err,
            "Counter store unavailable, call outcome not recorded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carevault_core::ManualClock;
    use carevault_store::testing::UnavailableStore;
    use carevault_store::{CounterStore, MemoryCounterStore};
    use std::sync::Arc;

    fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at(1_700_000_000));
        let store = MemoryCounterStore::with_clock(clock.clone());
        (
            CircuitBreaker::with_clock(config, Arc::new(store), clock.clone()),
            clock,
        )
    }

    async fn trip(cb: &CircuitBreaker) {
        for _ in 0..cb.config().failure_threshold {
            cb.record_failure().await;
        }
    }

    #[test]
    fn test_circuit_state_as_str() {
        assert_eq!(CircuitState::Closed.as_str(), "closed");
        assert_eq!(CircuitState::Open.as_str(), "open");
        assert_eq!(CircuitState::HalfOpen.as_str(), "half_open");
    }

    #[test]
    fn test_circuit_state_parse() {
        assert_eq!(CircuitState::parse("closed"), Some(CircuitState::Closed));
        assert_eq!(CircuitState::parse("open"), Some(CircuitState::Open));
        assert_eq!(CircuitState::parse("half_open"), Some(CircuitState::HalfOpen));
        assert_eq!(CircuitState::parse("invalid"), None);
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown, Duration::from_secs(900));
        assert_eq!(config.half_open_max_trials, 1);
    }

    #[test]
    fn test_config_builder() {
        let config = CircuitBreakerConfig::named("documents")
            .with_failure_threshold(3)
            .with_cooldown(Duration::from_secs(60))
            .with_half_open_max_trials(2);
        assert_eq!(config.name, "documents");
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.cooldown, Duration::from_secs(60));
        assert_eq!(config.half_open_max_trials, 2);
        assert_eq!(config.key("status"), "carevault:cb:documents:status");
    }

    #[tokio::test]
    async fn test_new_breaker_is_closed() {
        let (cb, _) = breaker(CircuitBreakerConfig::default());
        assert_eq!(cb.check().await, BreakerDecision::Allowed { trial: false });

        let status = cb.status().await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.last_transition_at, None);
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let (cb, _) = breaker(CircuitBreakerConfig::default());

        for _ in 0..4 {
            cb.record_failure().await;
        }
        assert!(cb.check().await.is_allowed());

        cb.record_failure().await;
        assert_eq!(
            cb.check().await,
            BreakerDecision::Rejected {
                retry_after_secs: 900
            }
        );
        assert_eq!(cb.status().await.unwrap().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let (cb, _) = breaker(CircuitBreakerConfig::default());

        for _ in 0..4 {
            cb.record_failure().await;
        }
        cb.record_success().await;
        assert_eq!(cb.status().await.unwrap().failure_count, 0);

        for _ in 0..4 {
            cb.record_failure().await;
        }
        assert!(cb.check().await.is_allowed());
    }

    #[tokio::test]
    async fn test_rejection_retry_hint_counts_down() {
        let (cb, clock) = breaker(CircuitBreakerConfig::default());
        trip(&cb).await;

        clock.advance_secs(600);
        assert_eq!(
            cb.check().await,
            BreakerDecision::Rejected {
                retry_after_secs: 300
            }
        );
    }

    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let (cb, clock) = breaker(CircuitBreakerConfig::default());
        trip(&cb).await;

        clock.advance_secs(900);
        assert_eq!(cb.check().await, BreakerDecision::Allowed { trial: true });
        assert_eq!(cb.status().await.unwrap().state, CircuitState::HalfOpen);

        assert_eq!(
            cb.check().await,
            BreakerDecision::Rejected {
                retry_after_secs: TRIAL_IN_FLIGHT_RETRY_SECS
            }
        );
    }

    #[tokio::test]
    async fn test_successful_trial_closes() {
        let (cb, clock) = breaker(CircuitBreakerConfig::default());
        trip(&cb).await;
        clock.advance_secs(900);
        assert!(cb.check().await.is_allowed());

        cb.record_success().await;

        let status = cb.status().await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(
            status.last_transition_at.map(|t| t.timestamp()),
            Some(1_700_000_900)
        );
        assert_eq!(cb.check().await, BreakerDecision::Allowed { trial: false });
    }

    #[tokio::test]
    async fn test_failed_trial_reopens_with_new_timestamp() {
        let (cb, clock) = breaker(CircuitBreakerConfig::default());
        trip(&cb).await;
        clock.advance_secs(1000);
        assert!(cb.check().await.is_allowed());

        cb.record_failure().await;

        let status = cb.status().await.unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(
            status.last_transition_at.map(|t| t.timestamp()),
            Some(1_700_001_000)
        );
        assert_eq!(
            cb.check().await,
            BreakerDecision::Rejected {
                retry_after_secs: 900
            }
        );

        // The next cooldown gets a fresh trial slot.
        clock.advance_secs(900);
        assert_eq!(cb.check().await, BreakerDecision::Allowed { trial: true });
    }

    #[tokio::test]
    async fn test_abandoned_trial_slot_expires() {
        let (cb, clock) = breaker(
            CircuitBreakerConfig::default().with_trial_timeout(Duration::from_secs(30)),
        );
        trip(&cb).await;
        clock.advance_secs(900);
        assert!(cb.check().await.is_allowed());
        assert!(!cb.check().await.is_allowed());

        clock.advance_secs(30);
        assert_eq!(cb.check().await, BreakerDecision::Allowed { trial: true });
    }

    #[tokio::test]
    async fn test_multiple_trials_when_configured() {
        let (cb, clock) = breaker(CircuitBreakerConfig::default().with_half_open_max_trials(2));
        trip(&cb).await;
        clock.advance_secs(900);

        assert!(cb.check().await.is_allowed());
        assert!(cb.check().await.is_allowed());
        assert!(!cb.check().await.is_allowed());
    }

    #[tokio::test]
    async fn test_failures_while_open_are_ignored() {
        let (cb, clock) = breaker(CircuitBreakerConfig::default());
        trip(&cb).await;
        clock.advance_secs(100);
        cb.record_failure().await;

        // Timestamp is unchanged, so the cooldown still ends at the original time.
        clock.advance_secs(800);
        assert!(cb.check().await.is_allowed());
    }

    #[tokio::test]
    async fn test_missing_timestamp_counts_as_elapsed() {
        let clock = Arc::new(ManualClock::at(1_700_000_000));
        let store = MemoryCounterStore::with_clock(clock.clone());
        store
            .set("carevault:cb:default:status", "open", None)
            .await
            .unwrap();
        let cb = CircuitBreaker::with_clock(
            CircuitBreakerConfig::default(),
            Arc::new(store),
            clock,
        );

        assert_eq!(cb.check().await, BreakerDecision::Allowed { trial: true });
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unavailable() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            Arc::new(UnavailableStore::new()),
        );

        cb.record_failure().await;
        cb.record_success().await;
        assert_eq!(cb.check().await, BreakerDecision::Allowed { trial: false });
        assert!(cb.status().await.is_err());
    }
}
