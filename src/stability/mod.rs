//! Stability patterns for fault tolerance and resilience

pub mod circuit_breaker;
pub mod headers;
pub mod rate_limiter;

pub use circuit_breaker::{
    BreakerRecord, BreakerSnapshot, CallPermit, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerError, CircuitBreakerRegistry, CircuitState,
};
pub use headers::{RateLimitHeaders, STATUS_SERVICE_UNAVAILABLE, STATUS_TOO_MANY_REQUESTS};
pub use rate_limiter::{
    RateDecision, RateLimiter, RateLimiterConfig, RateLimiterStats, ScopeKey, ScopeKind,
    ScopeLimiter, ScopeLimits, TieredDecision, TokenBucket,
};
