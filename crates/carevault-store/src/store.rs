//! The counter store contract.

use crate::error::StoreError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Atomic key-value primitives shared by every service instance.
///
/// Implementations must make `incr` atomic across concurrent callers and must
/// expire keys natively; callers never sweep expired keys themselves.
#[async_trait]
pub trait CounterStore: Send + Sync + fmt::Debug {
    /// Read a key. Missing or expired keys yield `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a key, optionally with a time-to-live in seconds.
    ///
    /// A `None` TTL removes any previous expiry on the key.
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StoreError>;

    /// Atomically increment an integer key, creating it at 0 first.
    ///
    /// Returns the post-increment value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Set the time-to-live of an existing key.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

/// Shared handle to a counter store.
pub type SharedCounterStore = Arc<dyn CounterStore>;
