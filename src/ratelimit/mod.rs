//! Sliding window rate limiting and its counter stores.

mod clock;
mod decision;
mod limiter;
mod memory;
mod policy;
mod presets;
mod redis_store;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{RateLimitDecision, RejectionBody};
pub use limiter::SlidingWindowLimiter;
pub use memory::InMemoryStore;
pub use policy::{IdentifierStrategy, RateLimitPolicy, DEFAULT_MESSAGE, KEY_PREFIX};
pub use presets::{PolicyDefinition, PolicyFile, PolicyTable, RouteRule, DEFAULT_POLICY, PRESETS};
pub use redis_store::RedisStore;
pub use store::{CounterStore, StoreError};
