//! In-process counter store.
//!
//! Provides the same TTL and atomicity semantics as the Redis backend within
//! a single process. Expired keys are dropped lazily on access, mirroring
//! Redis' passive expiry.

use crate::error::StoreError;
use crate::store::CounterStore;
use async_trait::async_trait;
use carevault_core::{SharedClock, SystemClock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// Unix second at which the entry stops being visible.
    expires_at: Option<i64>,
}

impl Entry {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Counter store kept in process memory.
///
/// Only correct for a single service instance; use
/// [`RedisCounterStore`](crate::RedisCounterStore) when running more than one.
#[derive(Debug, Clone)]
pub struct MemoryCounterStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: SharedClock,
}

impl MemoryCounterStore {
    /// Create an empty store driven by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Create an empty store driven by the given clock.
    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Remaining time-to-live of a key in seconds, if it has one.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_secs();
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at - now)
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now_secs();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

fn ttl_to_i64(ttl_secs: u64) -> i64 {
    i64::try_from(ttl_secs).unwrap_or(i64::MAX)
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StoreError> {
        let now = self.clock.now_secs();
        let expires_at = ttl_secs.map(|ttl| now.saturating_add(ttl_to_i64(ttl)));
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock();

        let current = match entries.get(key) {
            Some(entry) if entry.is_live(now) => {
                let parsed =
                    entry
                        .value
                        .parse::<i64>()
                        .map_err(|e| StoreError::InvalidValue {
                            key: key.to_string(),
                            message: e.to_string(),
                        })?;
                Some((parsed, entry.expires_at))
            }
            _ => None,
        };

        let (next, expires_at) = match current {
            Some((value, expires_at)) => (value.saturating_add(1), expires_at),
            None => (1, None),
        };

        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            if entry.is_live(now) {
                entry.expires_at = Some(now.saturating_add(ttl_to_i64(ttl_secs)));
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
