//! Redis-backed counter store using sorted sets.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::store::{CounterStore, StoreError};

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_io_error()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Default per-command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(250);

/// A counter store backed by Redis sorted sets.
///
/// The connection is established lazily on first use. When a command fails
/// at the connection level, the cached connection is dropped so the next
/// call reconnects; a single call never retries.
pub struct RedisStore {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    timeout: Duration,
}

impl RedisStore {
    /// Create a store for `url` without touching the network.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    /// Bound every command by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Round-trip a PING to verify connectivity.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(async move {
            let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    /// Get the cached connection or establish a new one.
    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        cached_or_connect(&self.connection, self.timeout, move || async move {
            let conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(StoreError::from)?;
            info!("Connected to Redis counter store");
            Ok::<_, StoreError>(conn)
        })
        .await
    }

    /// Run one command under the client timeout, invalidating the cached
    /// connection on connection-level failures.
    async fn bounded<T, F>(&self, command: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let result = match tokio::time::timeout(self.timeout, command).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout.as_millis() as u64)),
        };

        if let Err(ref err) = result {
            if matches!(err, StoreError::Unavailable(_) | StoreError::Timeout(_)) {
                warn!(error = %err, "Dropping Redis connection");
                let slot = tokio::time::timeout(self.timeout, self.connection.lock()).await;
                if let Ok(mut slot) = slot {
                    slot.take();
                }
            }
        }
        result
    }
}

/// Return the connection cached in `slot`, establishing one with `connect`
/// when it is empty.
///
/// Waiting for the slot and connecting share a single deadline, so callers
/// queued behind a hung connect give up after `timeout` like the one
/// connecting.
async fn cached_or_connect<C, F, Fut>(
    slot: &Mutex<Option<C>>,
    timeout: Duration,
    connect: F,
) -> Result<C, StoreError>
where
    C: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<C, StoreError>>,
{
    let attempt = async {
        let mut guard = slot.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = connect().await?;
        *guard = Some(conn.clone());
        Ok::<C, StoreError>(conn)
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| StoreError::Timeout(timeout.as_millis() as u64))?
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn add_scored(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(async move { conn.zadd::<_, _, _, ()>(key, member, score).await })
            .await
    }

    async fn remove_scored_below(&self, key: &str, max_score: i64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(async move {
            conn.zrembyscore::<_, _, _, ()>(key, "-inf", max_score)
                .await
        })
        .await
    }

    async fn count_all(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(async move { conn.zcard::<_, u64>(key).await })
            .await
    }

    async fn expire_in(&self, key: &str, seconds: u64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        debug!(key, seconds, "Refreshing key expiry");
        self.bounded(async move { conn.expire::<_, ()>(key, seconds as i64).await })
            .await
    }
}
