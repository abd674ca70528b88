//! # carevault-store
//!
//! Thin client over a distributed key-value store offering the handful of
//! atomic primitives the rate limiter and circuit breaker are built on:
//! increment, get/set with expiry, expire and delete.
//!
//! All cross-request and cross-instance coordination goes through these
//! primitives. Nothing in the resilience layer keeps in-process maps.
//!
//! ## Backends
//!
//! - [`RedisCounterStore`]: production backend using a multiplexed
//!   `redis::aio::ConnectionManager` with a per-operation timeout.
//! - [`MemoryCounterStore`]: single-process backend with TTL semantics driven
//!   by an injectable clock. Used for local development and tests.
//!
//! ```rust,ignore
//! use carevault_store::{CounterStore, RedisCounterStore, RedisStoreConfig};
//!
//! let store = RedisCounterStore::connect(RedisStoreConfig::new("redis://127.0.0.1/")).await?;
//! let n = store.incr("carevault:rl:count:203.0.113.7").await?;
//! if n == 1 {
//!     store.expire("carevault:rl:count:203.0.113.7", 3600).await?;
//! }
//! ```

mod error;
mod memory;
mod redis_store;
mod store;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::StoreError;
pub use memory::MemoryCounterStore;
pub use redis_store::{RedisCounterStore, RedisStoreConfig, DEFAULT_OPERATION_TIMEOUT_MS};
pub use store::{CounterStore, SharedCounterStore};
