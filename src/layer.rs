//! Assembled resilience layer
//!
//! Wires queue monitoring, admission, rate limiting, circuit breakers and
//! fallback together from one [`ResilienceConfig`].

use crate::admission::{Admission, AdmissionController, QueueMonitor, QueueSnapshot};
use crate::config::ResilienceConfig;
use crate::core::{Clock, QueueProbe, SystemClock};
use crate::error::Result;
use crate::fallback::{
    FallbackCoordinator, Outcome, ReplayHandler, ReplayReport, ResultCacheConfig, SpilloverWriter,
};
use crate::stability::{
    BreakerRecord, BreakerSnapshot, CircuitBreakerError, CircuitBreakerRegistry, RateDecision,
    RateLimiter, ScopeKey, ScopeLimiter, ScopeLimits, TokenBucket,
};
use crate::store::{InMemoryStore, StateStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Front door of the crate
///
/// # Example
///
/// ```no_run
/// use rust_resilience_system::{ResilienceConfig, ResilienceLayer};
/// use rust_resilience_system::core::{BoundedQueue, BoundedQueueConfig};
/// use std::sync::Arc;
///
/// # async fn example() -> rust_resilience_system::Result<()> {
/// let layer = ResilienceLayer::new(ResilienceConfig::new("/var/lib/ingest/spillover"))?;
///
/// let queue: Arc<BoundedQueue<Vec<u8>>> = Arc::new(BoundedQueue::new(BoundedQueueConfig::new()));
/// layer.register_queue("ingest", queue.clone());
///
/// if layer.admit("acme", Some("alice"), "ingest").is_accepted() {
///     let score = layer
///         .call("risk-score", async { Ok::<u32, std::io::Error>(7) }, |_| 0)
///         .await;
///     println!("score {score}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct ResilienceLayer {
    config: Arc<ResilienceConfig>,
    limiter: Arc<RateLimiter>,
    admission: AdmissionController,
    breakers: Arc<CircuitBreakerRegistry>,
    fallback: FallbackCoordinator,
}

impl ResilienceLayer {
    /// Build a layer with in-process state stores and the system clock
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::InvalidConfig`](crate::ResilienceError::InvalidConfig)
    /// if the configuration does not validate.
    pub fn new(config: ResilienceConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let buckets: Arc<dyn StateStore<TokenBucket>> =
            Arc::new(InMemoryStore::with_clock(Arc::clone(&clock)));
        let breakers: Arc<dyn StateStore<BreakerRecord>> =
            Arc::new(InMemoryStore::with_clock(Arc::clone(&clock)));
        Self::with_stores(config, buckets, breakers, clock)
    }

    /// Build a layer over externally owned stores
    ///
    /// Several processes sharing the same stores share buckets and breaker
    /// state.
    pub fn with_stores(
        config: ResilienceConfig,
        buckets: Arc<dyn StateStore<TokenBucket>>,
        breaker_records: Arc<dyn StateStore<BreakerRecord>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let limits = ScopeLimits {
            tenant: config.tenant_limit(),
            user: config.user_limit(),
            anonymous: config.anonymous_limit(),
        };
        let limiter = Arc::new(
            RateLimiter::new(limits.clone(), buckets, Arc::clone(&clock))
                .with_store_retry_interval(config.store_retry_interval()),
        );

        let admission = AdmissionController::new(
            Arc::new(QueueMonitor::new()),
            limiter.clone(),
            limits,
            Arc::clone(&clock),
        )
        .with_queue_full_threshold_percent(config.queue_full_threshold_percent)
        .with_queue_full_retry_after_secs(config.queue_full_retry_after_secs);

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.breaker(),
            breaker_records,
            Arc::clone(&clock),
        ));

        let fallback = FallbackCoordinator::new(
            Arc::clone(&breakers),
            ResultCacheConfig::new().with_staleness_limit(config.cache_staleness_limit()),
            SpilloverWriter::new(config.spillover(), Arc::clone(&clock)),
            clock,
        );

        tracing::info!(
            queue_threshold = config.queue_full_threshold_percent,
            tenant_rpm = config.tenant_requests_per_minute,
            user_rpm = config.user_requests_per_minute,
            spillover = %config.fallback_spillover_path.display(),
            "resilience layer initialized"
        );

        Ok(Self {
            config,
            limiter,
            admission,
            breakers,
            fallback,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Observe a queue under `name`
    pub fn register_queue(&self, name: impl Into<String>, probe: Arc<dyn QueueProbe>) {
        self.admission.monitor().register(name, probe);
    }

    /// Admit an authenticated request
    pub fn admit(&self, tenant_id: &str, user_id: Option<&str>, queue_name: &str) -> Admission {
        self.admission.admit(tenant_id, user_id, queue_name)
    }

    /// Admit an unauthenticated request
    pub fn admit_anonymous(&self, queue_name: &str) -> Admission {
        self.admission.admit_anonymous(queue_name)
    }

    /// Consume one token from `scope`
    pub fn check(&self, scope: &ScopeKey) -> RateDecision {
        self.limiter.check(scope)
    }

    /// Run `operation` behind the named breaker, or `fallback` on failure
    pub async fn call<T, E, Fut, FB>(&self, breaker: &str, operation: Fut, fallback: FB) -> T
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        FB: FnOnce(CircuitBreakerError<E>) -> T,
    {
        self.breakers.call(breaker, operation, fallback).await
    }

    /// Protected read with cached fallback
    pub async fn read<T, E, Fut>(&self, breaker: &str, correlation_key: &str, operation: Fut) -> Outcome<T>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.fallback.read(breaker, correlation_key, operation).await
    }

    /// Protected write with spillover fallback
    pub async fn write<P, E, Fut>(
        &self,
        breaker: &str,
        correlation_key: &str,
        payload: &P,
        operation: Fut,
    ) -> Result<Outcome<()>>
    where
        P: Serialize,
        E: fmt::Display,
        Fut: Future<Output = std::result::Result<(), E>>,
    {
        self.fallback
            .write(breaker, correlation_key, payload, operation)
            .await
    }

    /// Replay spilled writes once `breaker` is closed
    pub async fn replay_spillover<H: ReplayHandler>(&self, breaker: &str, handler: &H) -> Result<ReplayReport> {
        self.fallback.replay_spillover(breaker, handler).await
    }

    /// Force a breaker closed
    pub fn reset_circuit_breaker(&self, breaker: &str) {
        self.breakers.breaker(breaker).reset();
    }

    /// Depth of one queue
    pub fn queue_statistics(&self, queue_name: &str) -> Result<QueueSnapshot> {
        self.admission.monitor().snapshot(queue_name)
    }

    /// Depth of every readable queue
    pub fn all_queue_statistics(&self) -> Vec<QueueSnapshot> {
        self.admission.monitor().all_snapshots()
    }

    /// State of one breaker
    pub fn circuit_breaker_state(&self, breaker: &str) -> Option<BreakerSnapshot> {
        self.breakers.state(breaker)
    }

    /// State of every registered breaker
    pub fn all_circuit_breaker_states(&self) -> Vec<BreakerSnapshot> {
        self.breakers.states()
    }

    /// Admission controller
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Rate limiter
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Breaker registry
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Fallback coordinator
    pub fn fallback(&self) -> &FallbackCoordinator {
        &self.fallback
    }
}
