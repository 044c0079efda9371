//! In-process counter store.
//!
//! Mirrors the subset of sorted-set semantics the limiter relies on. Key
//! expiry is evaluated lazily against the shared clock, and
//! [`InMemoryStore::purge_expired`] reclaims keys nobody touches anymore.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::store::{CounterStore, StoreError};

/// One ordered set plus its expiry deadline.
#[derive(Debug, Default)]
struct ScoredSet {
    /// member -> score
    members: HashMap<String, i64>,
    /// Epoch ms after which the whole key is gone
    expires_at: Option<i64>,
}

impl ScoredSet {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now_ms)
    }
}

/// A counter store kept entirely in memory.
///
/// Only suitable for a single process; counts are not shared between
/// instances.
pub struct InMemoryStore {
    sets: DashMap<String, ScoredSet>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that evaluates expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            sets: DashMap::new(),
            clock,
        }
    }

    /// Drop every key whose expiry has passed.
    ///
    /// Returns the number of keys removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.sets.len();
        self.sets.retain(|_, set| !set.is_expired(now));
        let removed = before.saturating_sub(self.sets.len());
        if removed > 0 {
            debug!(removed, "Purged expired rate limit keys");
        }
        removed
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_ms();
        self.sets.iter().filter(|set| !set.is_expired(now)).count()
    }

    /// Remove all keys.
    pub fn clear(&self) {
        self.sets.clear();
    }

    /// Drop `key` if it has expired, so callers see a fresh set.
    fn evict_if_expired(&self, key: &str, now_ms: i64) {
        self.sets.remove_if(key, |_, set| set.is_expired(now_ms));
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryStore {
    async fn add_scored(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        self.evict_if_expired(key, now);

        let mut set = self.sets.entry(key.to_string()).or_default();
        set.members.insert(member.to_string(), score);
        trace!(key, member, score, "Added scored member");
        Ok(())
    }

    async fn remove_scored_below(&self, key: &str, max_score: i64) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        self.evict_if_expired(key, now);

        if let Some(mut set) = self.sets.get_mut(key) {
            set.members.retain(|_, score| *score > max_score);
        }
        Ok(())
    }

    async fn count_all(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_ms();
        self.evict_if_expired(key, now);

        Ok(self
            .sets
            .get(key)
            .map(|set| set.members.len() as u64)
            .unwrap_or(0))
    }

    async fn expire_in(&self, key: &str, seconds: u64) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        self.evict_if_expired(key, now);

        // Like EXPIRE, a missing key stays missing.
        if let Some(mut set) = self.sets.get_mut(key) {
            set.expires_at = Some(now + (seconds as i64) * 1000);
        }
        Ok(())
    }
}
