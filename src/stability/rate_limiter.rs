//! Rate limiting with token bucket algorithm
//!
//! Buckets live in a shared [`StateStore`] keyed by scope, so every check is
//! an optimistic load → refill/consume → compare-and-swap cycle. A lost race
//! simply retries against the fresh record; two callers can never consume
//! the same token.

use crate::core::Clock;
use crate::store::{CasOutcome, StateStore, StoreError};
use crate::telemetry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on optimistic retries for one check
const MAX_CAS_ATTEMPTS: usize = 64;

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Maximum number of tokens (burst capacity)
    pub capacity: u64,
    /// Number of tokens to refill per interval
    pub refill_amount: u64,
    /// Refill interval
    pub refill_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_amount: 10,
            refill_interval: Duration::from_secs(1),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new rate limiter configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set capacity (maximum tokens)
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set refill amount
    pub fn with_refill_amount(mut self, amount: u64) -> Self {
        self.refill_amount = amount;
        self
    }

    /// Set refill interval
    pub fn with_refill_interval(mut self, interval: Duration) -> Self {
        self.refill_interval = interval;
        self
    }

    /// Create configuration for requests per second
    pub fn per_second(rate: u64) -> Self {
        Self {
            capacity: rate,
            refill_amount: rate,
            refill_interval: Duration::from_secs(1),
        }
    }

    /// Create configuration for requests per minute
    pub fn per_minute(rate: u64) -> Self {
        Self {
            capacity: rate,
            refill_amount: rate,
            refill_interval: Duration::from_secs(60),
        }
    }

    /// Tokens added per second
    pub fn refill_rate_per_sec(&self) -> f64 {
        let secs = self.refill_interval.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.refill_amount as f64 / secs
    }

    /// Passive expiry of an idle bucket: twice the refill window
    pub fn bucket_ttl(&self) -> Duration {
        self.refill_interval.saturating_mul(2)
    }
}

/// Persisted token bucket record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    /// Maximum tokens
    pub capacity: u64,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Current tokens, always within `[0, capacity]`
    pub tokens: f64,
    /// Epoch milliseconds up to which elapsed time has been converted to tokens
    pub last_refill_ms: u64,
}

impl TokenBucket {
    /// A full bucket for a scope seen for the first time
    pub fn full(config: &RateLimiterConfig, now_ms: u64) -> Self {
        Self {
            capacity: config.capacity,
            refill_rate: config.refill_rate_per_sec(),
            tokens: config.capacity as f64,
            last_refill_ms: now_ms,
        }
    }

    /// Add whole tokens for the time elapsed since the last refill
    ///
    /// Only the time that produced whole tokens is consumed, so frequent
    /// checks never starve the bucket of fractional progress. A clock that
    /// moved backwards refills nothing and re-bases the bucket.
    pub fn refill(&mut self, now_ms: u64, config: &RateLimiterConfig) {
        self.capacity = config.capacity;
        self.refill_rate = config.refill_rate_per_sec();

        let capacity = self.capacity as f64;
        self.tokens = self.tokens.clamp(0.0, capacity);

        if now_ms <= self.last_refill_ms {
            self.last_refill_ms = now_ms;
            return;
        }

        let elapsed_secs = (now_ms - self.last_refill_ms) as f64 / 1000.0;
        let whole = (elapsed_secs * self.refill_rate).floor();

        if self.tokens + whole >= capacity {
            self.tokens = capacity;
            self.last_refill_ms = now_ms;
        } else if whole >= 1.0 {
            self.tokens += whole;
            let spent_ms = (whole * 1000.0 / self.refill_rate) as u64;
            self.last_refill_ms = (self.last_refill_ms + spent_ms).min(now_ms);
        }
    }

    /// Take one token if available
    pub fn try_consume(&mut self, refill_interval: Duration) -> RateDecision {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            RateDecision::Allowed {
                remaining: self.tokens.floor() as u64,
            }
        } else {
            RateDecision::Denied {
                retry_after_secs: self.retry_after_secs(refill_interval),
            }
        }
    }

    fn retry_after_secs(&self, refill_interval: Duration) -> u64 {
        if self.refill_rate <= 0.0 {
            // Nothing ever refills; advertise one full window
            return refill_interval.as_secs().max(1);
        }
        let wait = ((1.0 - self.tokens) / self.refill_rate).ceil();
        (wait as u64).max(1)
    }
}

/// Outcome of a single rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// A token was consumed
    Allowed {
        /// Whole tokens left after this request
        remaining: u64,
    },
    /// No token was available
    Denied {
        /// Seconds until a token will be available
        retry_after_secs: u64,
    },
    /// The store could not be used; the request is let through unmetered
    FailOpen {
        /// Configured capacity of the scope
        limit: u64,
    },
}

impl RateDecision {
    /// Whether the request may proceed
    pub fn is_allowed(&self) -> bool {
        !matches!(self, RateDecision::Denied { .. })
    }

    /// Whether the decision was made without consulting the store
    pub fn is_degraded(&self) -> bool {
        matches!(self, RateDecision::FailOpen { .. })
    }

    /// Advertised retry delay, zero unless denied
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            RateDecision::Denied { retry_after_secs } => *retry_after_secs,
            _ => 0,
        }
    }

    /// Tokens left in the scope
    pub fn remaining_tokens(&self) -> u64 {
        match self {
            RateDecision::Allowed { remaining } => *remaining,
            RateDecision::Denied { .. } => 0,
            RateDecision::FailOpen { limit } => *limit,
        }
    }
}

/// Kind of scope a bucket belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// Whole tenant
    Tenant,
    /// One user within a tenant
    User,
    /// All unauthenticated callers together
    Anonymous,
}

impl ScopeKind {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Tenant => "tenant",
            ScopeKind::User => "user",
            ScopeKind::Anonymous => "anonymous",
        }
    }
}

/// Bucket identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    kind: ScopeKind,
    key: String,
}

impl ScopeKey {
    /// `tenant:<id>`
    pub fn tenant(tenant_id: &str) -> Self {
        Self {
            kind: ScopeKind::Tenant,
            key: format!("tenant:{}", tenant_id),
        }
    }

    /// `user:<tenant>:<user>`
    pub fn user(tenant_id: &str, user_id: &str) -> Self {
        Self {
            kind: ScopeKind::User,
            key: format!("user:{}:{}", tenant_id, user_id),
        }
    }

    /// The shared anonymous scope
    pub fn anonymous() -> Self {
        Self {
            kind: ScopeKind::Anonymous,
            key: "anonymous".to_string(),
        }
    }

    /// Scope kind
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// Store key
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Bucket shapes per scope kind
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeLimits {
    /// Tenant buckets
    pub tenant: RateLimiterConfig,
    /// User buckets
    pub user: RateLimiterConfig,
    /// Anonymous bucket
    pub anonymous: RateLimiterConfig,
}

impl ScopeLimits {
    /// Limits expressed as requests per minute
    pub fn per_minute(tenant: u64, user: u64, anonymous: u64) -> Self {
        Self {
            tenant: RateLimiterConfig::per_minute(tenant),
            user: RateLimiterConfig::per_minute(user),
            anonymous: RateLimiterConfig::per_minute(anonymous),
        }
    }

    /// Configuration for a scope kind
    pub fn for_kind(&self, kind: ScopeKind) -> &RateLimiterConfig {
        match kind {
            ScopeKind::Tenant => &self.tenant,
            ScopeKind::User => &self.user,
            ScopeKind::Anonymous => &self.anonymous,
        }
    }
}

/// Outcome of a coarse-then-fine check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieredDecision {
    /// Every checked tier allowed the request
    Allowed {
        /// Remaining tokens of the finest tier checked
        remaining: u64,
    },
    /// A tier denied; later tiers were not consulted
    Denied {
        /// Kind of the scope that denied
        scope: ScopeKind,
        /// Seconds until that scope has a token again
        retry_after_secs: u64,
    },
}

/// Per-scope admission check
pub trait ScopeLimiter: Send + Sync {
    /// Consume one token from `scope`
    fn check(&self, scope: &ScopeKey) -> RateDecision;

    /// Check `coarse` first and only consult `fine` if it allowed
    fn check_tiered(&self, coarse: &ScopeKey, fine: Option<&ScopeKey>) -> TieredDecision {
        let mut remaining = match self.check(coarse) {
            RateDecision::Denied { retry_after_secs } => {
                return TieredDecision::Denied {
                    scope: coarse.kind(),
                    retry_after_secs,
                }
            }
            decision => decision.remaining_tokens(),
        };

        if let Some(fine) = fine {
            remaining = match self.check(fine) {
                RateDecision::Denied { retry_after_secs } => {
                    return TieredDecision::Denied {
                        scope: fine.kind(),
                        retry_after_secs,
                    }
                }
                decision => decision.remaining_tokens(),
            };
        }

        TieredDecision::Allowed { remaining }
    }
}

/// Rate limiter counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Requests that consumed a token
    pub allowed: u64,
    /// Requests denied for lack of tokens
    pub denied: u64,
    /// Requests let through because the store could not be used
    pub fail_open: u64,
}

/// Store-backed, scope-keyed token bucket limiter
///
/// # Example
///
/// ```
/// use rust_resilience_system::core::SystemClock;
/// use rust_resilience_system::stability::{RateLimiter, ScopeKey, ScopeLimiter, ScopeLimits, TokenBucket};
/// use rust_resilience_system::store::InMemoryStore;
/// use std::sync::Arc;
///
/// let limiter = RateLimiter::new(
///     ScopeLimits::per_minute(1000, 100, 10),
///     Arc::new(InMemoryStore::<TokenBucket>::new()),
///     Arc::new(SystemClock),
/// );
///
/// let decision = limiter.check(&ScopeKey::tenant("acme"));
/// assert!(decision.is_allowed());
/// assert_eq!(decision.remaining_tokens(), 999);
/// ```
pub struct RateLimiter {
    limits: ScopeLimits,
    store: Arc<dyn StateStore<TokenBucket>>,
    clock: Arc<dyn Clock>,
    store_retry_interval: Duration,
    fail_open_until_ms: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    fail_open: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter over a shared store
    pub fn new(
        limits: ScopeLimits,
        store: Arc<dyn StateStore<TokenBucket>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limits,
            store,
            clock,
            store_retry_interval: Duration::from_secs(30),
            fail_open_until_ms: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            fail_open: AtomicU64::new(0),
        }
    }

    /// Set how long to skip the store after it failed
    pub fn with_store_retry_interval(mut self, interval: Duration) -> Self {
        self.store_retry_interval = interval;
        self
    }

    /// Configured bucket shapes
    pub fn limits(&self) -> &ScopeLimits {
        &self.limits
    }

    /// Consume one token from an arbitrary named scope with its own limit
    ///
    /// This is the entry point for protected endpoints that are not tenant,
    /// user or anonymous scoped.
    pub fn check_with_limit(&self, key: &str, config: &RateLimiterConfig) -> RateDecision {
        let now = self.clock.now_ms();

        if now < self.fail_open_until_ms.load(Ordering::Acquire) {
            return self.record_fail_open(key, config);
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = match self.store.load(key) {
                Ok(current) => current,
                Err(err) => return self.on_store_error(key, config, err, now),
            };

            let (mut bucket, expected) = match current {
                Some(versioned) => (versioned.value, Some(versioned.version)),
                None => (TokenBucket::full(config, now), None),
            };

            bucket.refill(now, config);
            let decision = bucket.try_consume(config.refill_interval);

            match self
                .store
                .compare_and_swap(key, expected, bucket, Some(config.bucket_ttl()))
            {
                Ok(CasOutcome::Swapped(_)) => {
                    self.record(key, &decision);
                    return decision;
                }
                Ok(CasOutcome::Conflict) => continue,
                Err(err) => return self.on_store_error(key, config, err, now),
            }
        }

        self.on_store_error(key, config, StoreError::Contention(key.to_string()), now)
    }

    /// Tokens currently available to `scope`, without consuming any
    pub fn available_tokens(&self, scope: &ScopeKey) -> Option<u64> {
        let config = self.limits.for_kind(scope.kind());
        let now = self.clock.now_ms();

        let mut bucket = match self.store.load(scope.as_str()) {
            Ok(Some(versioned)) => versioned.value,
            Ok(None) => return Some(config.capacity),
            Err(_) => return None,
        };
        bucket.refill(now, config);
        Some(bucket.tokens.floor() as u64)
    }

    /// Counter snapshot
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
        }
    }

    fn record(&self, key: &str, decision: &RateDecision) {
        match decision {
            RateDecision::Allowed { remaining } => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(scope = key, remaining, "rate limit allowed");
            }
            RateDecision::Denied { retry_after_secs } => {
                self.denied.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(scope = key, retry_after_secs, "rate limit denied");
            }
            RateDecision::FailOpen { .. } => {}
        }
    }

    fn on_store_error(
        &self,
        key: &str,
        config: &RateLimiterConfig,
        err: StoreError,
        now_ms: u64,
    ) -> RateDecision {
        if matches!(err, StoreError::Unavailable(_)) {
            let until = now_ms.saturating_add(self.store_retry_interval.as_millis() as u64);
            self.fail_open_until_ms.store(until, Ordering::Release);
        }
        tracing::warn!(
            scope = key,
            error = %err,
            "Rate limit check failed, allowing request (fail-open)"
        );
        self.record_fail_open(key, config)
    }

    fn record_fail_open(&self, key: &str, config: &RateLimiterConfig) -> RateDecision {
        self.fail_open.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::RATELIMIT_DEGRADED).increment(1);
        tracing::debug!(scope = key, "rate limit bypassed while store unavailable");
        RateDecision::FailOpen {
            limit: config.capacity,
        }
    }
}

impl ScopeLimiter for RateLimiter {
    fn check(&self, scope: &ScopeKey) -> RateDecision {
        let config = self.limits.for_kind(scope.kind());
        self.check_with_limit(scope.as_str(), config)
    }
}
