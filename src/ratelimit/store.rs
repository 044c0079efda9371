//! Counter store abstraction.
//!
//! The limiter needs four primitives from an ordered, score-sortable store.
//! Anything that offers them (an in-process map for tests, Redis sorted sets
//! in production) can back the limiter.

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a counter store.
///
/// The limiter never propagates these; it logs them and fails open.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the client timeout
    #[error("Counter store timed out after {0} ms")]
    Timeout(u64),

    /// The store answered with an error
    #[error("Counter store error: {0}")]
    Backend(String),
}

/// Trait for counter store implementations.
///
/// Each method is a separate round-trip; no method is expected to be atomic
/// with respect to any other.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `member` with `score` to the ordered set under `key`.
    async fn add_scored(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError>;

    /// Remove every member of `key` whose score is `<= max_score`.
    async fn remove_scored_below(&self, key: &str, max_score: i64) -> Result<(), StoreError>;

    /// Number of members currently stored under `key`.
    async fn count_all(&self, key: &str) -> Result<u64, StoreError>;

    /// Expire the whole key `seconds` from now.
    async fn expire_in(&self, key: &str, seconds: u64) -> Result<(), StoreError>;
}
