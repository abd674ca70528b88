//! Counter stores that simulate infrastructure outages.
//!
//! Enabled with the `test-util` feature so that the resilience and pipeline
//! crates can exercise their fail-open paths.

use crate::error::StoreError;
use crate::memory::MemoryCounterStore;
use crate::store::CounterStore;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A store whose every operation fails as unreachable.
#[derive(Debug, Default)]
pub struct UnavailableStore {
    calls: AtomicUsize,
}

impl UnavailableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations attempted against the store.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[async_trait]
impl CounterStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<u64>) -> Result<(), StoreError> {
        self.fail()
    }

    async fn incr(&self, _key: &str) -> Result<i64, StoreError> {
        self.fail()
    }

    async fn expire(&self, _key: &str, _ttl: u64) -> Result<(), StoreError> {
        self.fail()
    }

    async fn del(&self, _key: &str) -> Result<(), StoreError> {
        self.fail()
    }
}

/// A memory store that can be switched into an outage at runtime.
#[derive(Debug, Clone)]
pub struct SwitchableStore {
    inner: MemoryCounterStore,
    down: Arc<AtomicBool>,
}

impl SwitchableStore {
    #[must_use]
    pub fn new(inner: MemoryCounterStore) -> Self {
        Self {
            inner,
            down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start or end a simulated outage.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CounterStore for SwitchableStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.check()?;
        self.inner.incr(key).await
    }

    async fn expire(&self, key: &str, ttl: u64) -> Result<(), StoreError> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.del(key).await
    }
}
