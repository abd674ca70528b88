//! Distributed rate limiting with IP lockout.
//!
//! Each key (normally the client IP) gets a counter that lives for one
//! window. The first increment in a window sets the counter's TTL, so the
//! window restarts on its own once it elapses. When the count exceeds the
//! threshold a lockout record is written with its own TTL; while it is live
//! the key is rejected without touching the counter.
//!
//! ## Failure policy
//!
//! If the counter store cannot be reached the limiter **fails open**: the
//! request is allowed and a warning is logged under the `rate_limit` target.

use carevault_core::{SharedClock, SystemClock};
use carevault_store::{SharedCounterStore, StoreError};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::DEFAULT_KEY_PREFIX;

/// Maximum requests per key per window for the public submission endpoint.
pub const DEFAULT_MAX_REQUESTS: u64 = 10;

/// Rate limit window in seconds (1 hour).
pub const DEFAULT_WINDOW_SECS: u64 = 3600;

/// Lockout duration in seconds once the threshold is exceeded (15 minutes).
pub const DEFAULT_LOCKOUT_SECS: u64 = 900;

/// Configuration for a [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Scope name separating the counters of different guarded endpoints.
    pub scope: String,
    /// Requests allowed per window; request `max_requests + 1` is locked out.
    pub max_requests: u64,
    /// Length of the counting window.
    pub window: Duration,
    /// How long a key stays blocked after exceeding the threshold.
    pub lockout: Duration,
    /// Prefix for counter store keys.
    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            scope: "default".to_string(),
            max_requests: DEFAULT_MAX_REQUESTS,
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            lockout: Duration::from_secs(DEFAULT_LOCKOUT_SECS),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl RateLimitConfig {
    /// Default configuration for a named scope.
    #[must_use]
    pub fn for_scope(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn with_lockout(mut self, lockout: Duration) -> Self {
        self.lockout = lockout;
        self
    }

    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn count_key(&self, key: &str) -> String {
        format!("{}:rl:{}:count:{}", self.key_prefix, self.scope, key)
    }

    fn lockout_key(&self, key: &str) -> String {
        format!("{}:rl:{}:lock:{}", self.key_prefix, self.scope, key)
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// A lockout from an earlier violation is still live.
    LockedOut,
    /// This request pushed the key over the threshold and started a lockout.
    ThresholdExceeded,
}

/// Result of [`RateLimiter::check_and_increment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The request may proceed.
    Allowed {
        /// Requests left in the current window. `None` when the limiter
        /// failed open and the count is unknown.
        remaining: Option<u64>,
    },
    /// The request is rejected.
    Denied {
        /// Seconds until the lockout ends; always at least 1.
        retry_after_secs: u64,
        reason: DenyReason,
    },
}

impl RateLimitDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }

    /// Retry hint for denied requests.
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RateLimitDecision::Allowed { .. } => None,
            RateLimitDecision::Denied {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
        }
    }

    fn failed_open() -> Self {
        RateLimitDecision::Allowed { remaining: None }
    }
}

/// Rate limiter whose counters live in a shared counter store.
///
/// Cloning is cheap; clones share the same store.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    store: SharedCounterStore,
    clock: SharedClock,
}

impl RateLimiter {
    /// Create a limiter using the system clock.
    #[must_use]
    pub fn new(config: RateLimitConfig, store: SharedCounterStore) -> Self {
        Self::with_clock(config, store, SystemClock::shared())
    }

    #[must_use]
    pub fn with_clock(config: RateLimitConfig, store: SharedCounterStore, clock: SharedClock) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request for `key` and decide whether it may proceed.
    ///
    /// Steps: a live lockout rejects immediately; otherwise the window
    /// counter is incremented atomically (the first increment sets its TTL);
    /// a post-increment count above the threshold writes a lockout and
    /// rejects.
    pub async fn check_and_increment(&self, key: &str) -> RateLimitDecision {
        match self.try_check_and_increment(key).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(
                    target: "rate_limit",
                    scope = %self.config.scope,
                    key = %key,
                    error = %err,
                    "Counter store unavailable, rate limiter failing open"
                );
                RateLimitDecision::failed_open()
            }
        }
    }

    async fn try_check_and_increment(&self, key: &str) -> Result<RateLimitDecision, StoreError> {
        let now = self.clock.now_secs();
        let lockout_key = self.config.lockout_key(key);

        if let Some(blocked_until) = self.store.get(&lockout_key).await? {
            match blocked_until.parse::<i64>() {
                Ok(until) if now < until => {
                    return Ok(RateLimitDecision::Denied {
                        retry_after_secs: secs_until(now, until),
                        reason: DenyReason::LockedOut,
                    });
                }
                Ok(_) => {}
                Err(_) => {
                    // Unreadable lockout record: drop it rather than block forever.
                    warn!(
                        target: "rate_limit",
                        key = %key,
                        value = %blocked_until,
                        "Discarding malformed lockout record"
                    );
                    self.store.del(&lockout_key).await?;
                }
            }
        }

        let count_key = self.config.count_key(key);
        let count = self.store.incr(&count_key).await?.max(0);

        if count == 1 {
            self.store
                .expire(&count_key, self.config.window.as_secs())
                .await?;
        }

        let count = u64::try_from(count).unwrap_or(0);
        if count > self.config.max_requests {
            return self.lock_out(key, &lockout_key, &count_key, now, count).await;
        }

        let remaining = self.config.max_requests.saturating_sub(count);
        debug!(
            target: "rate_limit",
            scope = %self.config.scope,
            key = %key,
            count,
            remaining,
            "Request counted"
        );

        Ok(RateLimitDecision::Allowed {
            remaining: Some(remaining),
        })
    }

    async fn lock_out(
        &self,
        key: &str,
        lockout_key: &str,
        count_key: &str,
        now: i64,
        count: u64,
    ) -> Result<RateLimitDecision, StoreError> {
        let lockout_secs = self.config.lockout.as_secs().max(1);
        let blocked_until = now.saturating_add(i64::try_from(lockout_secs).unwrap_or(i64::MAX));

        self.store
            .set(lockout_key, &blocked_until.to_string(), Some(lockout_secs))
            .await?;
        // The lockout supersedes the window; counting restarts after it ends.
        self.store.del(count_key).await?;

        warn!(
            target: "rate_limit",
            scope = %self.config.scope,
            key = %key,
            count,
            threshold = self.config.max_requests,
            blocked_until,
            "Rate limit exceeded, key locked out"
        );

        Ok(RateLimitDecision::Denied {
            retry_after_secs: lockout_secs,
            reason: DenyReason::ThresholdExceeded,
        })
    }
}

fn secs_until(now: i64, until: i64) -> u64 {
    u64::try_from(until.saturating_sub(now)).unwrap_or(0).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use carevault_core::ManualClock;
    use carevault_store::testing::UnavailableStore;
    use carevault_store::{CounterStore, MemoryCounterStore};
    use std::sync::Arc;

    struct Fixture {
        limiter: RateLimiter,
        store: MemoryCounterStore,
        clock: Arc<ManualClock>,
    }

    fn fixture(config: RateLimitConfig) -> Fixture {
        let clock = Arc::new(ManualClock::at(1_700_000_000));
        let store = MemoryCounterStore::with_clock(clock.clone());
        let limiter = RateLimiter::with_clock(config, Arc::new(store.clone()), clock.clone());
        Fixture {
            limiter,
            store,
            clock,
        }
    }

    #[test]
    fn test_default_config() {
        let config = RateLimitConfig::default();
        assert_eq!(config.max_requests, 10);
        assert_eq!(config.window, Duration::from_secs(3600));
        assert_eq!(config.lockout, Duration::from_secs(900));
        assert_eq!(config.key_prefix, "carevault");
    }

    #[test]
    fn test_keys_are_scoped() {
        let config = RateLimitConfig::for_scope("submission");
        assert_eq!(
            config.count_key("10.0.0.1"),
            "carevault:rl:submission:count:10.0.0.1"
        );
        assert_eq!(
            config.lockout_key("10.0.0.1"),
            "carevault:rl:submission:lock:10.0.0.1"
        );
    }

    #[tokio::test]
    async fn test_allows_up_to_threshold_then_denies() {
        let f = fixture(RateLimitConfig::default());

        for i in 0..10 {
            let decision = f.limiter.check_and_increment("192.168.1.100").await;
            assert!(decision.is_allowed(), "request {} should pass", i + 1);
        }

        let decision = f.limiter.check_and_increment("192.168.1.100").await;
        assert_eq!(
            decision,
            RateLimitDecision::Denied {
                retry_after_secs: 900,
                reason: DenyReason::ThresholdExceeded,
            }
        );
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let f = fixture(RateLimitConfig::default().with_max_requests(3));
        let key = "10.0.0.1";

        assert_eq!(
            f.limiter.check_and_increment(key).await,
            RateLimitDecision::Allowed { remaining: Some(2) }
        );
        assert_eq!(
            f.limiter.check_and_increment(key).await,
            RateLimitDecision::Allowed { remaining: Some(1) }
        );
        assert_eq!(
            f.limiter.check_and_increment(key).await,
            RateLimitDecision::Allowed { remaining: Some(0) }
        );
    }

    #[tokio::test]
    async fn test_first_increment_sets_window_ttl() {
        let f = fixture(RateLimitConfig::for_scope("s"));
        f.limiter.check_and_increment("k").await;
        assert_eq!(f.store.ttl("carevault:rl:s:count:k"), Some(3600));

        f.clock.advance_secs(100);
        f.limiter.check_and_increment("k").await;
        // A later increment must not extend the window.
        assert_eq!(f.store.ttl("carevault:rl:s:count:k"), Some(3500));
    }

    #[tokio::test]
    async fn test_lockout_reports_remaining_time() {
        let f = fixture(RateLimitConfig::default().with_max_requests(1));
        f.limiter.check_and_increment("k").await;
        f.limiter.check_and_increment("k").await;

        f.clock.advance_secs(600);
        assert_eq!(
            f.limiter.check_and_increment("k").await,
            RateLimitDecision::Denied {
                retry_after_secs: 300,
                reason: DenyReason::LockedOut,
            }
        );
    }

    #[tokio::test]
    async fn test_lockout_overrides_counting() {
        let f = fixture(RateLimitConfig::for_scope("s").with_max_requests(1));
        f.limiter.check_and_increment("k").await;
        f.limiter.check_and_increment("k").await;

        for _ in 0..5 {
            assert!(!f.limiter.check_and_increment("k").await.is_allowed());
        }
        // Counter was dropped at lockout and is not touched while locked.
        assert_eq!(f.store.get("carevault:rl:s:count:k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_new_window_after_lockout_expires() {
        let f = fixture(RateLimitConfig::default().with_max_requests(2));
        for _ in 0..3 {
            f.limiter.check_and_increment("k").await;
        }
        assert!(!f.limiter.check_and_increment("k").await.is_allowed());

        f.clock.advance_secs(900);
        assert_eq!(
            f.limiter.check_and_increment("k").await,
            RateLimitDecision::Allowed { remaining: Some(1) }
        );
    }

    #[tokio::test]
    async fn test_window_expiry_resets_count() {
        let f = fixture(RateLimitConfig::default().with_max_requests(2));
        f.limiter.check_and_increment("k").await;
        f.limiter.check_and_increment("k").await;

        f.clock.advance_secs(3600);
        assert_eq!(
            f.limiter.check_and_increment("k").await,
            RateLimitDecision::Allowed { remaining: Some(1) }
        );
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let f = fixture(RateLimitConfig::default().with_max_requests(1));
        f.limiter.check_and_increment("a").await;
        assert!(!f.limiter.check_and_increment("a").await.is_allowed());
        assert!(f.limiter.check_and_increment("b").await.is_allowed());
    }

    #[tokio::test]
    async fn test_malformed_lockout_record_is_discarded() {
        let f = fixture(RateLimitConfig::for_scope("s"));
        f.store
            .set("carevault:rl:s:lock:k", "garbage", Some(60))
            .await
            .unwrap();

        assert!(f.limiter.check_and_increment("k").await.is_allowed());
        assert_eq!(f.store.get("carevault:rl:s:lock:k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unavailable() {
        let store = Arc::new(UnavailableStore::new());
        let limiter = RateLimiter::new(RateLimitConfig::default(), store.clone());

        for _ in 0..20 {
            assert_eq!(
                limiter.check_and_increment("k").await,
                RateLimitDecision::Allowed { remaining: None }
            );
        }
        assert!(store.calls() >= 20);
    }

    #[test]
    fn test_retry_after_accessor() {
        assert_eq!(
            RateLimitDecision::Allowed { remaining: Some(1) }.retry_after_secs(),
            None
        );
        assert_eq!(
            RateLimitDecision::Denied {
                retry_after_secs: 42,
                reason: DenyReason::LockedOut
            }
            .retry_after_secs(),
            Some(42)
        );
    }

    #[test]
    fn test_secs_until_is_at_least_one() {
        assert_eq!(secs_until(100, 100), 1);
        assert_eq!(secs_until(100, 160), 60);
    }
}
