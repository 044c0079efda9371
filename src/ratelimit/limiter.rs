//! Sliding window rate limiter.
//!
//! For every identifier the counter store holds one ordered set of request
//! timestamps. A check purges entries that fell out of the window, counts what
//! is left, and records the current request only if it is admitted.
//!
//! # Accuracy
//!
//! Purge, count, insert and expiry refresh are separate round-trips. Two
//! concurrent checks for the same identifier can both observe
//! `max_requests - 1` and both be admitted, so the window may transiently
//! over-admit by up to the number of concurrent racers. This is an accepted
//! trade-off; strict admission would need the four steps wrapped in a single
//! server-side script against the store.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::decision::RateLimitDecision;
use super::policy::RateLimitPolicy;
use super::store::{CounterStore, StoreError};

/// The sliding window limiter.
///
/// Holds no per-identifier state of its own; all coordination happens in the
/// shared counter store, so a limiter can be cloned into every request task.
pub struct SlidingWindowLimiter<S: CounterStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: CounterStore + ?Sized> Clone for SlidingWindowLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<S: CounterStore + ?Sized> SlidingWindowLimiter<S> {
    /// Create a limiter over `store` using wall-clock time.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a limiter over `store` reading time from `clock`.
    pub fn with_clock(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Decide whether the request identified by `identifier` is admitted.
    ///
    /// Never fails: if the store cannot be reached the request is admitted
    /// with `remaining == limit`.
    pub async fn check(&self, identifier: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let key = policy.store_key(identifier);

        match self.try_check(&key, now, policy).await {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(
                        key = %key,
                        limit = decision.limit,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Counter store failed, allowing request");
                Self::fail_open(now, policy)
            }
        }
    }

    /// Report current usage for `identifier` without recording a request.
    pub async fn peek(&self, identifier: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let key = policy.store_key(identifier);
        let window_start = now - policy.window_ms();

        let counted = async {
            self.store.remove_scored_below(&key, window_start).await?;
            self.store.count_all(&key).await
        };

        match counted.await {
            Ok(count) => {
                let limit = policy.max_requests();
                Self::decision(now, policy, count < limit, limit.saturating_sub(count))
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Counter store failed during peek");
                Self::fail_open(now, policy)
            }
        }
    }

    async fn try_check(
        &self,
        key: &str,
        now: i64,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitDecision, StoreError> {
        let window_start = now - policy.window_ms();
        let limit = policy.max_requests();

        self.store.remove_scored_below(key, window_start).await?;
        let count = self.store.count_all(key).await?;
        let allowed = count < limit;

        trace!(key, count, limit, allowed, "Sliding window counted");

        if allowed {
            let member = format!("{}:{}", now, rand::random::<u64>());
            self.store.add_scored(key, &member, now).await?;
            self.store.expire_in(key, policy.retry_after_secs()).await?;
        }

        // Admitted requests consume one slot of the pre-insert count.
        let used = if allowed { count + 1 } else { count };
        Ok(Self::decision(now, policy, allowed, limit.saturating_sub(used)))
    }

    fn fail_open(now: i64, policy: &RateLimitPolicy) -> RateLimitDecision {
        RateLimitDecision {
            fail_open: true,
            ..Self::decision(now, policy, true, policy.max_requests())
        }
    }

    fn decision(
        now: i64,
        policy: &RateLimitPolicy,
        allowed: bool,
        remaining: u64,
    ) -> RateLimitDecision {
        RateLimitDecision {
            allowed,
            limit: policy.max_requests(),
            remaining,
            reset_at: now + policy.window_ms(),
            retry_after_seconds: policy.retry_after_secs(),
            fail_open: false,
        }
    }
}
