//! The outcome of a single rate limit check.

use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// The policy's ceiling
    pub limit: u64,
    /// Capacity left after this request
    pub remaining: u64,
    /// Epoch ms by which the window is guaranteed to have slid clear
    pub reset_at: i64,
    /// `ceil(window / 1s)`, constant for a policy
    pub retry_after_seconds: u64,
    /// The store could not be consulted and the request was let through
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fail_open: bool,
}

impl RateLimitDecision {
    /// Rate limit headers for this decision.
    ///
    /// `Retry-After` is only present on rejections.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(4);
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_at));
        if !self.allowed {
            headers.insert(RETRY_AFTER, HeaderValue::from(self.retry_after_seconds));
        }
        headers
    }

    /// JSON body sent with a rejection.
    pub fn rejection_body(&self, message: &str) -> RejectionBody {
        RejectionBody {
            error: message.to_string(),
            limit: self.limit,
            remaining: self.remaining,
            reset: self.reset_at,
            retry_after: self.retry_after_seconds,
        }
    }
}

/// Wire shape of a rejection response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub limit: u64,
    pub remaining: u64,
    pub reset: i64,
    pub retry_after: u64,
}
