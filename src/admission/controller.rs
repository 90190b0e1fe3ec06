//! Ingress admission control
//!
//! Checks run cheapest-first and stop at the first rejection: queue depth,
//! then the tenant bucket, then the user bucket. A request rejected for
//! backpressure never touches the rate limiter.

use super::queue_monitor::QueueMonitor;
use crate::core::Clock;
use crate::stability::{
    RateDecision, RateLimitHeaders, ScopeKey, ScopeKind, ScopeLimiter, ScopeLimits,
    TieredDecision, STATUS_SERVICE_UNAVAILABLE, STATUS_TOO_MANY_REQUESTS,
};
use crate::telemetry;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Why a request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The target queue is above its utilization threshold
    QueueFull,
    /// The tenant bucket is empty
    TenantRateLimit,
    /// The user bucket is empty
    UserRateLimit,
    /// The shared anonymous bucket is empty
    AnonymousRateLimit,
}

impl RejectReason {
    /// Stable label for logs, metrics and response bodies
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::QueueFull => "queue_full",
            RejectReason::TenantRateLimit => "tenant_rate_limit",
            RejectReason::UserRateLimit => "user_rate_limit",
            RejectReason::AnonymousRateLimit => "anonymous_rate_limit",
        }
    }

    /// HTTP status for this rejection
    pub fn status_code(&self) -> u16 {
        match self {
            RejectReason::QueueFull => STATUS_SERVICE_UNAVAILABLE,
            _ => STATUS_TOO_MANY_REQUESTS,
        }
    }

    fn from_scope(kind: ScopeKind) -> Self {
        match kind {
            ScopeKind::Tenant => RejectReason::TenantRateLimit,
            ScopeKind::User => RejectReason::UserRateLimit,
            ScopeKind::Anonymous => RejectReason::AnonymousRateLimit,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Request may proceed
    Accept {
        /// Tokens left in the finest scope checked
        remaining: u64,
    },
    /// Request is refused; no further processing in this layer
    Reject {
        /// First check that failed
        reason: RejectReason,
        /// Seconds the caller should wait before retrying
        retry_after_secs: u64,
    },
}

impl Admission {
    /// Whether the request was accepted
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accept { .. })
    }

    /// Rejection reason, if any
    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Admission::Reject { reason, .. } => Some(*reason),
            Admission::Accept { .. } => None,
        }
    }

    /// Retry delay, zero when accepted
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Admission::Reject {
                retry_after_secs, ..
            } => *retry_after_secs,
            Admission::Accept { .. } => 0,
        }
    }
}

/// Admission counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    /// Requests accepted
    pub accepted: u64,
    /// Rejected by queue backpressure
    pub rejected_queue_full: u64,
    /// Rejected by the tenant bucket
    pub rejected_tenant: u64,
    /// Rejected by the user bucket
    pub rejected_user: u64,
    /// Rejected by the anonymous bucket
    pub rejected_anonymous: u64,
}

impl AdmissionStats {
    /// Total rejections of any kind
    pub fn rejected(&self) -> u64 {
        self.rejected_queue_full + self.rejected_tenant + self.rejected_user + self.rejected_anonymous
    }
}

/// Orders the queue check and the tiered rate-limit check
///
/// # Example
///
/// ```
/// use rust_resilience_system::admission::{AdmissionController, QueueMonitor};
/// use rust_resilience_system::core::{BoundedQueue, BoundedQueueConfig, SystemClock};
/// use rust_resilience_system::stability::{RateLimiter, ScopeLimits, TokenBucket};
/// use rust_resilience_system::store::InMemoryStore;
/// use std::sync::Arc;
///
/// let limits = ScopeLimits::per_minute(1000, 100, 10);
/// let limiter = Arc::new(RateLimiter::new(
///     limits.clone(),
///     Arc::new(InMemoryStore::<TokenBucket>::new()),
///     Arc::new(SystemClock),
/// ));
///
/// let monitor = Arc::new(QueueMonitor::new());
/// let queue: Arc<BoundedQueue<Vec<u8>>> = Arc::new(BoundedQueue::new(BoundedQueueConfig::new()));
/// monitor.register("ingest", queue);
///
/// let controller = AdmissionController::new(monitor, limiter, limits, Arc::new(SystemClock));
/// assert!(controller.admit("acme", Some("alice"), "ingest").is_accepted());
/// ```
pub struct AdmissionController {
    monitor: Arc<QueueMonitor>,
    limiter: Arc<dyn ScopeLimiter>,
    limits: ScopeLimits,
    clock: Arc<dyn Clock>,
    queue_full_threshold_percent: f64,
    queue_full_retry_after_secs: u64,
    accepted: AtomicU64,
    rejected_queue_full: AtomicU64,
    rejected_tenant: AtomicU64,
    rejected_user: AtomicU64,
    rejected_anonymous: AtomicU64,
}

impl AdmissionController {
    /// Create a controller with a 90 % queue threshold and a 1 s queue-full retry
    pub fn new(
        monitor: Arc<QueueMonitor>,
        limiter: Arc<dyn ScopeLimiter>,
        limits: ScopeLimits,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            monitor,
            limiter,
            limits,
            clock,
            queue_full_threshold_percent: 90.0,
            queue_full_retry_after_secs: 1,
            accepted: AtomicU64::new(0),
            rejected_queue_full: AtomicU64::new(0),
            rejected_tenant: AtomicU64::new(0),
            rejected_user: AtomicU64::new(0),
            rejected_anonymous: AtomicU64::new(0),
        }
    }

    /// Set the utilization percent above which queues reject
    pub fn with_queue_full_threshold_percent(mut self, percent: f64) -> Self {
        self.queue_full_threshold_percent = percent;
        self
    }

    /// Set the retry delay advertised on queue-full rejections
    pub fn with_queue_full_retry_after_secs(mut self, secs: u64) -> Self {
        self.queue_full_retry_after_secs = secs;
        self
    }

    /// Admit an authenticated request
    pub fn admit(&self, tenant_id: &str, user_id: Option<&str>, queue_name: &str) -> Admission {
        if let Some(rejection) = self.check_queue(queue_name) {
            return rejection;
        }

        let tenant = ScopeKey::tenant(tenant_id);
        let user = user_id.map(|user_id| ScopeKey::user(tenant_id, user_id));

        let admission = match self.limiter.check_tiered(&tenant, user.as_ref()) {
            TieredDecision::Allowed { remaining } => Admission::Accept { remaining },
            TieredDecision::Denied {
                scope,
                retry_after_secs,
            } => Admission::Reject {
                reason: RejectReason::from_scope(scope),
                retry_after_secs,
            },
        };

        self.record(tenant_id, queue_name, &admission);
        admission
    }

    /// Admit an unauthenticated request against the shared anonymous bucket
    pub fn admit_anonymous(&self, queue_name: &str) -> Admission {
        if let Some(rejection) = self.check_queue(queue_name) {
            return rejection;
        }

        let admission = match self.limiter.check(&ScopeKey::anonymous()) {
            RateDecision::Denied { retry_after_secs } => Admission::Reject {
                reason: RejectReason::AnonymousRateLimit,
                retry_after_secs,
            },
            decision => Admission::Accept {
                remaining: decision.remaining_tokens(),
            },
        };

        self.record("anonymous", queue_name, &admission);
        admission
    }

    /// HTTP status and headers for a decision
    ///
    /// `finest` selects which bucket's capacity is advertised on an accepted
    /// request.
    pub fn response_headers(&self, admission: &Admission, finest: ScopeKind) -> (u16, RateLimitHeaders) {
        match admission {
            Admission::Accept { remaining } => (
                200,
                RateLimitHeaders::allowed(self.limits.for_kind(finest).capacity, *remaining),
            ),
            Admission::Reject {
                reason: RejectReason::QueueFull,
                retry_after_secs,
            } => (
                STATUS_SERVICE_UNAVAILABLE,
                RateLimitHeaders::retry_only(*retry_after_secs),
            ),
            Admission::Reject {
                reason,
                retry_after_secs,
            } => {
                let kind = match reason {
                    RejectReason::TenantRateLimit => ScopeKind::Tenant,
                    RejectReason::UserRateLimit => ScopeKind::User,
                    _ => ScopeKind::Anonymous,
                };
                (
                    reason.status_code(),
                    RateLimitHeaders::rate_limited(
                        self.limits.for_kind(kind).capacity,
                        *retry_after_secs,
                        self.clock.now_ms(),
                    ),
                )
            }
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected_queue_full: self.rejected_queue_full.load(Ordering::Relaxed),
            rejected_tenant: self.rejected_tenant.load(Ordering::Relaxed),
            rejected_user: self.rejected_user.load(Ordering::Relaxed),
            rejected_anonymous: self.rejected_anonymous.load(Ordering::Relaxed),
        }
    }

    /// Queue monitor consulted by this controller
    pub fn monitor(&self) -> &Arc<QueueMonitor> {
        &self.monitor
    }

    fn check_queue(&self, queue_name: &str) -> Option<Admission> {
        if !self
            .monitor
            .is_over_threshold(queue_name, self.queue_full_threshold_percent)
        {
            return None;
        }

        let admission = Admission::Reject {
            reason: RejectReason::QueueFull,
            retry_after_secs: self.queue_full_retry_after_secs,
        };
        self.record("-", queue_name, &admission);
        Some(admission)
    }

    fn record(&self, scope: &str, queue_name: &str, admission: &Admission) {
        match admission {
            Admission::Accept { .. } => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::ADMISSION_ALLOWED).increment(1);
            }
            Admission::Reject {
                reason,
                retry_after_secs,
            } => {
                let counter = match reason {
                    RejectReason::QueueFull => &self.rejected_queue_full,
                    RejectReason::TenantRateLimit => &self.rejected_tenant,
                    RejectReason::UserRateLimit => &self.rejected_user,
                    RejectReason::AnonymousRateLimit => &self.rejected_anonymous,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::ADMISSION_REJECTED, "reason" => reason.as_str())
                    .increment(1);
                tracing::debug!(
                    scope,
                    queue = queue_name,
                    reason = reason.as_str(),
                    retry_after_secs,
                    "request rejected"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, QueueDepth, QueueProbe};
    use crate::error::Result;
    use crate::stability::{RateLimiter, TokenBucket};
    use crate::store::InMemoryStore;
    use parking_lot::Mutex;

    struct FixedProbe(QueueDepth);

    impl QueueProbe for FixedProbe {
        fn probe(&self) -> Result<QueueDepth> {
            Ok(self.0)
        }
    }

    /// Counts checks and always allows
    #[derive(Default)]
    struct CountingLimiter {
        calls: Mutex<Vec<String>>,
    }

    impl ScopeLimiter for CountingLimiter {
        fn check(&self, scope: &ScopeKey) -> RateDecision {
            self.calls.lock().push(scope.to_string());
            RateDecision::Allowed { remaining: 5 }
        }
    }

    fn monitor_with(size: u64, capacity: u64) -> Arc<QueueMonitor> {
        let monitor = Arc::new(QueueMonitor::new());
        monitor.register(
            "ingest",
            Arc::new(FixedProbe(QueueDepth {
                size,
                capacity,
                active_consumers: 1,
            })),
        );
        monitor
    }

    fn real_controller(monitor: Arc<QueueMonitor>, limits: ScopeLimits) -> AdmissionController {
        let clock = ManualClock::new(1_700_000_000_000);
        let store: Arc<InMemoryStore<TokenBucket>> =
            Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = Arc::new(RateLimiter::new(
            limits.clone(),
            store,
            Arc::new(clock.clone()),
        ));
        AdmissionController::new(monitor, limiter, limits, Arc::new(clock))
    }

    #[test]
    fn test_queue_full_skips_rate_limiter() {
        let limiter = Arc::new(CountingLimiter::default());
        let controller = AdmissionController::new(
            monitor_with(91, 100),
            limiter.clone(),
            ScopeLimits::per_minute(1000, 100, 10),
            Arc::new(ManualClock::new(0)),
        );

        let admission = controller.admit("acme", Some("alice"), "ingest");
        assert_eq!(
            admission,
            Admission::Reject {
                reason: RejectReason::QueueFull,
                retry_after_secs: 1,
            }
        );
        assert!(limiter.calls.lock().is_empty());

        controller.admit_anonymous("ingest");
        assert!(limiter.calls.lock().is_empty());
        assert_eq!(controller.stats().rejected_queue_full, 2);
    }

    #[test]
    fn test_tenant_checked_before_user() {
        let limiter = Arc::new(CountingLimiter::default());
        let controller = AdmissionController::new(
            monitor_with(0, 100),
            limiter.clone(),
            ScopeLimits::per_minute(1000, 100, 10),
            Arc::new(ManualClock::new(0)),
        );

        assert!(controller.admit("acme", Some("alice"), "ingest").is_accepted());
        assert_eq!(
            *limiter.calls.lock(),
            vec!["tenant:acme".to_string(), "user:acme:alice".to_string()]
        );
    }

    #[test]
    fn test_user_limit() {
        let controller = real_controller(monitor_with(0, 100), ScopeLimits::per_minute(1000, 2, 10));

        assert!(controller.admit("acme", Some("alice"), "ingest").is_accepted());
        assert!(controller.admit("acme", Some("alice"), "ingest").is_accepted());

        let admission = controller.admit("acme", Some("alice"), "ingest");
        assert_eq!(admission.reason(), Some(RejectReason::UserRateLimit));
        assert_eq!(admission.retry_after_secs(), 30);

        // Other users of the same tenant are unaffected
        assert!(controller.admit("acme", Some("bob"), "ingest").is_accepted());
    }

    #[test]
    fn test_tenant_limit_short_circuits_user() {
        let controller = real_controller(monitor_with(0, 100), ScopeLimits::per_minute(1, 100, 10));

        assert!(controller.admit("acme", Some("alice"), "ingest").is_accepted());
        let admission = controller.admit("acme", Some("bob"), "ingest");
        assert_eq!(admission.reason(), Some(RejectReason::TenantRateLimit));
        assert_eq!(controller.stats().rejected_tenant, 1);
    }

    #[test]
    fn test_anonymous_bucket_is_shared() {
        let controller = real_controller(monitor_with(0, 100), ScopeLimits::per_minute(1000, 100, 2));

        assert!(controller.admit_anonymous("ingest").is_accepted());
        assert!(controller.admit_anonymous("ingest").is_accepted());
        let admission = controller.admit_anonymous("ingest");
        assert_eq!(admission.reason(), Some(RejectReason::AnonymousRateLimit));
        assert_eq!(controller.stats().rejected_anonymous, 1);
    }

    #[test]
    fn test_unknown_queue_admits() {
        let controller = real_controller(Arc::new(QueueMonitor::new()), ScopeLimits::per_minute(10, 10, 10));

        assert!(controller.admit("acme", None, "not-registered").is_accepted());
        assert_eq!(controller.monitor().degraded_observations(), 1);
    }

    #[test]
    fn test_response_headers() {
        let controller = real_controller(monitor_with(0, 100), ScopeLimits::per_minute(1000, 1, 10));

        let accepted = controller.admit("acme", Some("alice"), "ingest");
        let (status, headers) = controller.response_headers(&accepted, ScopeKind::User);
        assert_eq!(status, 200);
        assert_eq!(headers.limit, Some(1));
        assert_eq!(headers.remaining, Some(0));

        let rejected = controller.admit("acme", Some("alice"), "ingest");
        let (status, headers) = controller.response_headers(&rejected, ScopeKind::User);
        assert_eq!(status, 429);
        assert_eq!(headers.retry_after, Some(std::time::Duration::from_secs(60)));
        assert_eq!(headers.reset_at, Some(1_700_000_060));

        let queue_full = Admission::Reject {
            reason: RejectReason::QueueFull,
            retry_after_secs: 1,
        };
        let (status, headers) = controller.response_headers(&queue_full, ScopeKind::User);
        assert_eq!(status, 503);
        assert_eq!(headers.limit, None);
    }
}
