//! Circuit Breaker pattern implementation for fault tolerance
//!
//! Each breaker owns exactly one [`BreakerRecord`] in a shared state store.
//! Every transition is a compare-and-swap on that record, so when several
//! workers observe the same trigger only one of them performs the
//! transition and restarts the cooldown clock.

use crate::core::Clock;
use crate::store::{CasOutcome, StateStore, StoreError, Versioned};
use crate::telemetry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAX_CAS_ATTEMPTS: usize = 64;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, testing if service recovered
    HalfOpen,
}

impl CircuitState {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure ratio in `(0, 1]` that opens the circuit
    pub failure_rate_threshold: f64,
    /// Minimum requests in the rolling window before the ratio is evaluated
    pub request_volume_threshold: u64,
    /// Time the circuit stays open before a trial call is allowed
    pub cooldown: Duration,
    /// Deadline for each protected call
    pub call_timeout: Duration,
    /// Concurrent trial calls allowed while half-open
    pub half_open_max_trials: u32,
    /// Trial successes needed to close the circuit
    pub success_threshold: u32,
    /// Length of the closed-state rolling window
    pub rolling_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            request_volume_threshold: 10,
            cooldown: Duration::from_secs(5),
            call_timeout: Duration::from_secs(10),
            half_open_max_trials: 1,
            success_threshold: 1,
            rolling_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure ratio threshold
    pub fn with_failure_rate_threshold(mut self, ratio: f64) -> Self {
        self.failure_rate_threshold = ratio;
        self
    }

    /// Set request volume threshold
    pub fn with_request_volume_threshold(mut self, volume: u64) -> Self {
        self.request_volume_threshold = volume;
        self
    }

    /// Set cooldown duration
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Set call deadline
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set half-open trial concurrency
    pub fn with_half_open_max_trials(mut self, trials: u32) -> Self {
        self.half_open_max_trials = trials.max(1);
        self
    }

    /// Set success threshold
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set rolling window length
    pub fn with_rolling_window(mut self, window: Duration) -> Self {
        self.rolling_window = window;
        self
    }
}

/// Persisted breaker record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerRecord {
    /// Current state
    pub state: CircuitState,
    /// Outcomes recorded in the current window
    pub request_count: u64,
    /// Failures recorded in the current window
    pub failure_count: u64,
    /// Epoch milliseconds at which the current window started
    pub window_start_ms: u64,
    /// Epoch milliseconds of the last transition to open
    pub opened_at_ms: Option<u64>,
    /// Trial calls currently running in half-open
    pub trials_in_flight: u32,
    /// Successful trials since entering half-open
    pub trial_successes: u32,
    /// Configured failure ratio
    pub failure_rate_threshold: f64,
    /// Configured request volume threshold
    pub request_volume_threshold: u64,
    /// Configured cooldown in milliseconds
    pub cooldown_ms: u64,
}

impl BreakerRecord {
    fn closed(config: &CircuitBreakerConfig, now_ms: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            request_count: 0,
            failure_count: 0,
            window_start_ms: now_ms,
            opened_at_ms: None,
            trials_in_flight: 0,
            trial_successes: 0,
            failure_rate_threshold: config.failure_rate_threshold,
            request_volume_threshold: config.request_volume_threshold,
            cooldown_ms: config.cooldown.as_millis() as u64,
        }
    }

    fn reset_counters(&mut self, now_ms: u64) {
        self.request_count = 0;
        self.failure_count = 0;
        self.window_start_ms = now_ms;
        self.trials_in_flight = 0;
        self.trial_successes = 0;
    }

    fn open(&mut self, now_ms: u64) {
        self.state = CircuitState::Open;
        self.opened_at_ms = Some(now_ms);
        self.reset_counters(now_ms);
    }

    fn close(&mut self, now_ms: u64) {
        self.state = CircuitState::Closed;
        self.opened_at_ms = None;
        self.reset_counters(now_ms);
    }

    fn window_expired(&self, window: Duration, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.window_start_ms) >= window.as_millis() as u64
    }

    fn should_trip(&self) -> bool {
        if self.request_count == 0 || self.request_count < self.request_volume_threshold {
            return false;
        }
        let rate = self.failure_count as f64 / self.request_count as f64;
        rate >= self.failure_rate_threshold
    }
}

/// Point-in-time view of a breaker for observability
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    /// Protected operation name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Outcomes recorded in the current window
    pub request_count: u64,
    /// Failures recorded in the current window
    pub failure_count: u64,
    /// Epoch milliseconds of the last transition to open
    pub opened_at_ms: Option<u64>,
}

/// Kind of permission granted for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    /// Closed-state call, tallied in the rolling window
    Normal,
    /// Half-open probe
    Trial,
    /// Store unusable; the call runs but its outcome is not recorded
    Untracked,
}

/// Permission to run one protected call
///
/// Dropping a permit without reporting an outcome counts as a failure, so a
/// caller that abandons its call cannot leave a half-open trial slot taken.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this call is a half-open probe
    pub fn is_trial(&self) -> bool {
        self.kind == PermitKind::Trial
    }

    /// Report a successful outcome
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_outcome(self.kind, true);
    }

    /// Report a failed outcome
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_outcome(self.kind, false);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(breaker = %self.breaker.name, "call permit dropped without outcome");
            self.breaker.record_outcome(self.kind, false);
        }
    }
}

/// Circuit breaker error
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request rejected without calling the operation
    CircuitOpen,
    /// The operation did not finish before the deadline
    Timeout(Duration),
    /// Inner operation failed
    InnerError(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "Circuit breaker is open"),
            CircuitBreakerError::Timeout(after) => {
                write!(f, "Operation timed out after {:?}", after)
            }
            CircuitBreakerError::InnerError(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CircuitBreakerError::InnerError(e) => Some(e),
            _ => None,
        }
    }
}

/// Circuit Breaker for fault tolerance
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    store: Arc<dyn StateStore<BreakerRecord>>,
    clock: Arc<dyn Clock>,
    degraded: AtomicU64,
}

impl CircuitBreaker {
    /// Create a breaker and register its record if absent
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        store: Arc<dyn StateStore<BreakerRecord>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            store,
            clock,
            degraded: AtomicU64::new(0),
        };
        breaker.register();
        breaker
    }

    fn register(&self) {
        let record = BreakerRecord::closed(&self.config, self.clock.now_ms());
        match self.store.compare_and_swap(&self.name, None, record, None) {
            Ok(CasOutcome::Swapped(_)) => {
                tracing::info!(breaker = %self.name, "circuit breaker registered");
            }
            // Already registered by another worker or process
            Ok(CasOutcome::Conflict) => {}
            Err(err) => {
                tracing::warn!(breaker = %self.name, error = %err, "could not register circuit breaker record");
            }
        }
    }

    /// Protected operation name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask for permission to run one call
    ///
    /// Returns `None` when the call must be short-circuited.
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let kind = self.acquire_kind()?;
        Some(CallPermit {
            breaker: self,
            kind,
            settled: false,
        })
    }

    fn acquire_kind(&self) -> Option<PermitKind> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now_ms();
            let (mut record, expected) = match self.load() {
                Ok(loaded) => loaded,
                Err(err) => return Some(self.untracked(&err)),
            };
            let from = record.state;

            let (kind, changed) = match record.state {
                CircuitState::Closed => {
                    if record.window_expired(self.config.rolling_window, now) {
                        record.reset_counters(now);
                        (PermitKind::Normal, true)
                    } else {
                        (PermitKind::Normal, false)
                    }
                }
                CircuitState::Open => {
                    let opened_at = record.opened_at_ms.unwrap_or(now);
                    if now.saturating_sub(opened_at) < self.config.cooldown.as_millis() as u64 {
                        return None;
                    }
                    record.state = CircuitState::HalfOpen;
                    record.reset_counters(now);
                    record.trials_in_flight = 1;
                    (PermitKind::Trial, true)
                }
                CircuitState::HalfOpen => {
                    if record.trials_in_flight >= self.config.half_open_max_trials {
                        return None;
                    }
                    record.trials_in_flight += 1;
                    (PermitKind::Trial, true)
                }
            };

            if !changed {
                return Some(kind);
            }

            let to = record.state;
            match self.swap(expected, record) {
                Ok(CasOutcome::Swapped(_)) => {
                    if from != to {
                        self.transitioned(from, to);
                    }
                    return Some(kind);
                }
                Ok(CasOutcome::Conflict) => continue,
                Err(err) => return Some(self.untracked(&err)),
            }
        }

        Some(self.untracked(&StoreError::Contention(self.name.clone())))
    }

    fn record_outcome(&self, kind: PermitKind, success: bool) {
        if kind == PermitKind::Untracked {
            return;
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now_ms();
            let (mut record, expected) = match self.load() {
                Ok(loaded) => loaded,
                Err(err) => {
                    self.untracked(&err);
                    return;
                }
            };
            let from = record.state;

            match (kind, record.state) {
                (PermitKind::Normal, CircuitState::Closed) => {
                    if record.window_expired(self.config.rolling_window, now) {
                        record.reset_counters(now);
                    }
                    record.request_count += 1;
                    if !success {
                        record.failure_count += 1;
                    }
                    if record.should_trip() {
                        record.open(now);
                    }
                }
                (PermitKind::Trial, CircuitState::HalfOpen) => {
                    record.trials_in_flight = record.trials_in_flight.saturating_sub(1);
                    if success {
                        record.trial_successes += 1;
                        if record.trial_successes >= self.config.success_threshold {
                            record.close(now);
                        }
                    } else {
                        record.open(now);
                    }
                }
                // Another worker already moved the breaker on; this outcome is stale
                _ => return,
            }

            let to = record.state;
            match self.swap(expected, record) {
                Ok(CasOutcome::Swapped(_)) => {
                    if from != to {
                        self.transitioned(from, to);
                    }
                    return;
                }
                Ok(CasOutcome::Conflict) => continue,
                Err(err) => {
                    self.untracked(&err);
                    return;
                }
            }
        }

        self.untracked(&StoreError::Contention(self.name.clone()));
    }

    /// Execute a future with circuit breaker protection and a deadline
    ///
    /// Exceeding the deadline abandons the future and counts as a failure.
    pub async fn call<F, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let permit = match self.try_acquire() {
            Some(permit) => permit,
            None => return Err(CircuitBreakerError::CircuitOpen),
        };

        match tokio::time::timeout(self.config.call_timeout, f).await {
            Ok(Ok(result)) => {
                permit.success();
                Ok(result)
            }
            Ok(Err(err)) => {
                permit.failure();
                Err(CircuitBreakerError::InnerError(err))
            }
            Err(_) => {
                tracing::warn!(
                    breaker = %self.name,
                    timeout_ms = self.config.call_timeout.as_millis() as u64,
                    "protected call exceeded deadline"
                );
                permit.failure();
                Err(CircuitBreakerError::Timeout(self.config.call_timeout))
            }
        }
    }

    /// Get current state
    ///
    /// An open breaker past its cooldown still reports `Open` until the next
    /// call moves it to half-open. Reports `Closed` when the store is down,
    /// matching the fail-open behaviour of calls.
    pub fn state(&self) -> CircuitState {
        self.peek_state().unwrap_or(CircuitState::Closed)
    }

    /// Full view of the record, `None` if the store is unreachable
    pub fn snapshot(&self) -> Option<BreakerSnapshot> {
        let (record, _) = self.load().ok()?;
        Some(BreakerSnapshot {
            name: self.name.clone(),
            state: record.state,
            request_count: record.request_count,
            failure_count: record.failure_count,
            opened_at_ms: record.opened_at_ms,
        })
    }

    /// Calls let through without bookkeeping because the store was unusable
    pub fn degraded_count(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now_ms();
            let (mut record, expected) = match self.load() {
                Ok(loaded) => loaded,
                Err(err) => {
                    self.untracked(&err);
                    return;
                }
            };
            let from = record.state;
            record.close(now);

            match self.swap(expected, record) {
                Ok(CasOutcome::Swapped(_)) => {
                    if from != CircuitState::Closed {
                        self.transitioned(from, CircuitState::Closed);
                    }
                    return;
                }
                Ok(CasOutcome::Conflict) => continue,
                Err(err) => {
                    self.untracked(&err);
                    return;
                }
            }
        }
    }

    fn peek_state(&self) -> Option<CircuitState> {
        self.load().ok().map(|(record, _)| record.state)
    }

    fn load(&self) -> Result<(BreakerRecord, Option<u64>), StoreError> {
        Ok(match self.store.load(&self.name)? {
            Some(Versioned { value, version }) => (value, Some(version)),
            None => (BreakerRecord::closed(&self.config, self.clock.now_ms()), None),
        })
    }

    fn swap(&self, expected: Option<u64>, record: BreakerRecord) -> Result<CasOutcome, StoreError> {
        self.store.compare_and_swap(&self.name, expected, record, None)
    }

    fn untracked(&self, err: &StoreError) -> PermitKind {
        self.degraded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::BREAKER_DEGRADED, "breaker" => self.name.clone())
            .increment(1);
        tracing::warn!(
            breaker = %self.name,
            error = %err,
            "Circuit breaker state unavailable, passing call through (fail-open)"
        );
        PermitKind::Untracked
    }

    fn transitioned(&self, from: CircuitState, to: CircuitState) {
        metrics::counter!(
            telemetry::BREAKER_TRANSITIONS,
            "breaker" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);
        tracing::info!(
            breaker = %self.name,
            from = from.as_str(),
            to = to.as_str(),
            "circuit breaker transition"
        );
    }
}

/// Breakers by protected-operation name, registered lazily
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    store: Arc<dyn StateStore<BreakerRecord>>,
    clock: Arc<dyn Clock>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry
    pub fn new(
        default_config: CircuitBreakerConfig,
        store: Arc<dyn StateStore<BreakerRecord>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            default_config,
            store,
            clock,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a breaker with its own configuration
    ///
    /// Returns the existing breaker if the name is already registered.
    pub fn register(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            return Arc::clone(existing);
        }

        // Registration talks to the store; keep it outside the map lock
        let breaker = Arc::new(CircuitBreaker::new(
            name,
            config,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
        ));

        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(name.to_string()).or_insert(breaker))
    }

    /// Get a breaker, registering it with the default configuration
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(name) {
                return Arc::clone(breaker);
            }
        }

        self.register(name, self.default_config.clone())
    }

    /// Run `operation` behind the named breaker, or `fallback` if it cannot
    /// produce a result
    pub async fn call<T, E, Fut, FB>(&self, name: &str, operation: Fut, fallback: FB) -> T
    where
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(CircuitBreakerError<E>) -> T,
    {
        let breaker = self.breaker(name);
        match breaker.call(operation).await {
            Ok(value) => value,
            Err(err) => fallback(err),
        }
    }

    /// Snapshot of one breaker, `None` if unknown or unreadable
    pub fn state(&self, name: &str) -> Option<BreakerSnapshot> {
        let breaker = self.breakers.read().get(name).cloned()?;
        breaker.snapshot()
    }

    /// Snapshots of every registered breaker, sorted by name
    pub fn states(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        let mut snapshots: Vec<BreakerSnapshot> =
            breakers.iter().filter_map(|breaker| breaker.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Number of registered breakers
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// Check if no breaker is registered
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}
