//! Injectable time source.
//!
//! Rate-limit windows, lockouts and breaker cooldowns are wall-clock based.
//! Production code injects [`SystemClock`]; tests inject a [`ManualClock`]
//! and advance it instead of sleeping.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Abstraction over wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Current time as whole Unix seconds.
    fn now_secs(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl SystemClock {
    /// Convenience constructor for a shared system clock.
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

/// Manually advanced clock with one-second resolution.
#[derive(Debug)]
pub struct ManualClock {
    secs: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at the given Unix timestamp.
    #[must_use]
    pub fn at(unix_secs: i64) -> Self {
        Self {
            secs: AtomicI64::new(unix_secs),
        }
    }

    /// Create a clock frozen at the current system time.
    #[must_use]
    pub fn starting_now() -> Self {
        Self::at(Utc::now().timestamp())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.secs.fetch_add(by.num_seconds(), Ordering::SeqCst);
    }

    /// Move the clock forward by whole seconds.
    pub fn advance_secs(&self, secs: i64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.secs.load(Ordering::SeqCst), 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn now_secs(&self) -> i64 {
        self.secs.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at(1_000);
        assert_eq!(clock.now_secs(), 1_000);

        clock.advance_secs(60);
        assert_eq!(clock.now_secs(), 1_060);

        clock.advance(Duration::minutes(15));
        assert_eq!(clock.now_secs(), 1_960);
        assert_eq!(clock.now().timestamp(), 1_960);
    }

    #[test]
    fn test_system_clock_is_close_to_now() {
        let clock = SystemClock;
        let diff = (Utc::now() - clock.now()).num_seconds().abs();
        assert!(diff <= 1);
    }
}
