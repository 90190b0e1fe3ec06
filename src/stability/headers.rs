//! Rate limit response headers
//!
//! Renders the headers and status code an HTTP front end attaches to an
//! admission decision.

use std::collections::HashMap;
use std::time::Duration;

/// `429 Too Many Requests`
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// `503 Service Unavailable`
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

/// Rate limit information to attach to a response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Bucket capacity of the scope that decided
    pub limit: Option<u64>,

    /// Whole tokens left in that scope
    pub remaining: Option<u64>,

    /// Unix timestamp (seconds) at which a retry is expected to succeed
    pub reset_at: Option<u64>,

    /// Delay the client should wait before retrying
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Create empty headers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers for a request that passed the limiter
    #[must_use]
    pub fn allowed(limit: u64, remaining: u64) -> Self {
        Self {
            limit: Some(limit),
            remaining: Some(remaining),
            ..Self::default()
        }
    }

    /// Headers for a rate limit rejection
    #[must_use]
    pub fn rate_limited(limit: u64, retry_after_secs: u64, now_ms: u64) -> Self {
        Self {
            limit: Some(limit),
            remaining: Some(0),
            reset_at: Some(now_ms / 1000 + retry_after_secs),
            retry_after: Some(Duration::from_secs(retry_after_secs)),
        }
    }

    /// Headers for a backpressure rejection; only `Retry-After` applies
    #[must_use]
    pub fn retry_only(retry_after_secs: u64) -> Self {
        Self {
            retry_after: Some(Duration::from_secs(retry_after_secs)),
            ..Self::default()
        }
    }

    /// Header name/value pairs, omitting unset fields
    #[must_use]
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(4);

        if let Some(retry) = self.retry_after {
            pairs.push(("Retry-After", retry.as_secs().to_string()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("X-RateLimit-Limit", limit.to_string()));
        }
        if let Some(remaining) = self.remaining {
            pairs.push(("X-RateLimit-Remaining", remaining.to_string()));
        }
        if let Some(reset) = self.reset_at {
            pairs.push(("X-RateLimit-Reset", reset.to_string()));
        }

        pairs
    }

    /// Same as [`to_pairs`](Self::to_pairs), keyed by lowercase header name
    #[must_use]
    pub fn to_map(&self) -> HashMap<String, String> {
        self.to_pairs()
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect()
    }
}
