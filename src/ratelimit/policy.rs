//! Rate limit policy value objects.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;

use crate::error::{RatewardenError, Result};
use crate::web::RequestMeta;

/// Prefix for every counter store key.
pub const KEY_PREFIX: &str = "ratelimit:";

/// Rejection message used when a policy does not set one.
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// How a request is turned into a rate limit bucket identifier.
#[derive(Clone, Default)]
pub enum IdentifierStrategy {
    /// `"<ip>:<path>"`, limits per route per client
    #[default]
    IpAndPath,
    /// `"<ip>"`, one bucket per client across all routes
    Ip,
    /// `"user:<id>"` read from a header, falling back to the client IP
    User {
        /// Header carrying the authenticated user id
        header: String,
    },
    /// Caller-supplied derivation
    Custom(Arc<dyn Fn(&RequestMeta<'_>) -> String + Send + Sync>),
}

impl IdentifierStrategy {
    /// Derive the identifier for a request.
    ///
    /// Never fails; missing client information becomes `"unknown"`.
    pub fn identify(&self, meta: &RequestMeta<'_>) -> String {
        match self {
            IdentifierStrategy::IpAndPath => format!("{}:{}", meta.client_ip(), meta.path()),
            IdentifierStrategy::Ip => meta.client_ip(),
            IdentifierStrategy::User { header } => match meta.header(header) {
                Some(user) if !user.trim().is_empty() => format!("user:{}", user.trim()),
                _ => meta.client_ip(),
            },
            IdentifierStrategy::Custom(derive) => {
                let id = derive(meta);
                if id.is_empty() {
                    "unknown".to_string()
                } else {
                    id
                }
            }
        }
    }
}

impl fmt::Debug for IdentifierStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierStrategy::IpAndPath => write!(f, "IpAndPath"),
            IdentifierStrategy::Ip => write!(f, "Ip"),
            IdentifierStrategy::User { header } => {
                f.debug_struct("User").field("header", header).finish()
            }
            IdentifierStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// An immutable rate limit policy.
///
/// Policies are shared freely between concurrent checks. To change limiting
/// behavior, build a new policy; the builder methods consume `self`.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    window: Duration,
    max_requests: u64,
    identifier: IdentifierStrategy,
    message: String,
    status_code: StatusCode,
    scope: Option<String>,
}

impl RateLimitPolicy {
    /// Allow `max_requests` per identifier in any sliding `window`.
    pub fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            window,
            max_requests,
            identifier: IdentifierStrategy::default(),
            message: DEFAULT_MESSAGE.to_string(),
            status_code: StatusCode::TOO_MANY_REQUESTS,
            scope: None,
        }
    }

    /// Shorthand for [`RateLimitPolicy::new`] with a millisecond window.
    pub fn from_millis(window_ms: u64, max_requests: u64) -> Self {
        Self::new(Duration::from_millis(window_ms), max_requests)
    }

    pub fn with_identifier(mut self, identifier: IdentifierStrategy) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_status(mut self, status_code: StatusCode) -> Self {
        self.status_code = status_code;
        self
    }

    /// Namespace this policy's buckets so they never mix with another
    /// policy's buckets for the same identifier.
    pub fn scoped(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_ms(&self) -> i64 {
        self.window.as_millis() as i64
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn identifier(&self) -> &IdentifierStrategy {
        &self.identifier
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// `ceil(window / 1s)`, at least one second.
    pub fn retry_after_secs(&self) -> u64 {
        let ms = self.window.as_millis() as u64;
        ms.div_ceil(1000).max(1)
    }

    /// Counter store key for `identifier` under this policy.
    pub fn store_key(&self, identifier: &str) -> String {
        match &self.scope {
            Some(scope) => format!("{KEY_PREFIX}{scope}:{identifier}"),
            None => format!("{KEY_PREFIX}{identifier}"),
        }
    }

    /// Reject a zero window or a zero ceiling.
    pub fn validate(&self) -> Result<()> {
        if self.window.as_millis() == 0 {
            return Err(RatewardenError::Config(
                "rate limit window must be at least 1 ms".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(RatewardenError::Config(
                "rate limit max_requests must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
