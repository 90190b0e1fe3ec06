//! Layer-wide configuration
//!
//! One immutable struct carries every recognized option. It is validated
//! once when the layer is built and shared behind an `Arc` afterwards.

use crate::error::{ResilienceError, Result};
use crate::fallback::SpilloverConfig;
use crate::stability::{CircuitBreakerConfig, RateLimiterConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

fn default_anonymous_rpm() -> u64 {
    10
}

fn default_half_open_max_trials() -> u32 {
    1
}

fn default_success_threshold() -> u32 {
    1
}

fn default_rolling_window_ms() -> u64 {
    60_000
}

fn default_queue_full_retry_after_secs() -> u64 {
    1
}

fn default_spillover_max_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_store_retry_interval_ms() -> u64 {
    30_000
}

/// Resilience layer configuration
///
/// The first nine fields must be present when deserializing; the remaining
/// ones fall back to conservative defaults.
///
/// ```
/// use rust_resilience_system::ResilienceConfig;
///
/// let config: ResilienceConfig = serde_json::from_str(r#"{
///     "queueFullThresholdPercent": 90.0,
///     "tenantRequestsPerMinute": 1000,
///     "userRequestsPerMinute": 100,
///     "breakerTimeoutMs": 10000,
///     "failureRateThresholdPercent": 50.0,
///     "requestVolumeThreshold": 10,
///     "openCooldownMs": 5000,
///     "fallbackSpilloverPath": "/var/lib/ingest/spillover",
///     "cacheStalenessLimitMs": 30000
/// }"#).unwrap();
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.anonymous_requests_per_minute, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceConfig {
    /// Queue utilization percent above which ingress is rejected
    pub queue_full_threshold_percent: f64,
    /// Token-bucket capacity and per-minute refill for a tenant
    pub tenant_requests_per_minute: u64,
    /// Token-bucket capacity and per-minute refill for a user within a tenant
    pub user_requests_per_minute: u64,
    /// Deadline for every protected call
    pub breaker_timeout_ms: u64,
    /// Failure rate (percent) that trips a breaker
    pub failure_rate_threshold_percent: f64,
    /// Minimum rolling request count before a breaker may trip
    pub request_volume_threshold: u64,
    /// Time an open breaker waits before allowing a trial call
    pub open_cooldown_ms: u64,
    /// Directory receiving write-path spill files
    pub fallback_spillover_path: PathBuf,
    /// Maximum age of a cached read-path result served as fallback
    #[serde(alias = "cacheStalenessLimit")]
    pub cache_staleness_limit_ms: u64,

    /// Shared bucket for unauthenticated requests
    #[serde(default = "default_anonymous_rpm")]
    pub anonymous_requests_per_minute: u64,
    /// Concurrent trial calls allowed while half-open
    #[serde(default = "default_half_open_max_trials")]
    pub half_open_max_trials: u32,
    /// Trial successes needed to close a half-open breaker
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Length of the closed-state rolling window
    #[serde(default = "default_rolling_window_ms")]
    pub rolling_window_ms: u64,
    /// Retry delay advertised on `queue_full` rejections
    #[serde(default = "default_queue_full_retry_after_secs")]
    pub queue_full_retry_after_secs: u64,
    /// Byte budget of the spillover directory
    #[serde(default = "default_spillover_max_bytes")]
    pub spillover_max_bytes: u64,
    /// How long the limiter stays fail-open after the store went away
    #[serde(default = "default_store_retry_interval_ms")]
    pub store_retry_interval_ms: u64,
}

impl ResilienceConfig {
    /// Create a configuration with production defaults
    ///
    /// Tenants get 1000 req/min, users 100 req/min, anonymous callers
    /// 10 req/min. Breakers trip at 50 % failures over at least 10 calls,
    /// time calls out after 10 s and cool down for 5 s.
    pub fn new(spillover_path: impl Into<PathBuf>) -> Self {
        Self {
            queue_full_threshold_percent: 90.0,
            tenant_requests_per_minute: 1000,
            user_requests_per_minute: 100,
            breaker_timeout_ms: 10_000,
            failure_rate_threshold_percent: 50.0,
            request_volume_threshold: 10,
            open_cooldown_ms: 5_000,
            fallback_spillover_path: spillover_path.into(),
            cache_staleness_limit_ms: 30_000,
            anonymous_requests_per_minute: default_anonymous_rpm(),
            half_open_max_trials: default_half_open_max_trials(),
            success_threshold: default_success_threshold(),
            rolling_window_ms: default_rolling_window_ms(),
            queue_full_retry_after_secs: default_queue_full_retry_after_secs(),
            spillover_max_bytes: default_spillover_max_bytes(),
            store_retry_interval_ms: default_store_retry_interval_ms(),
        }
    }

    /// Set queue-full threshold percent
    pub fn with_queue_full_threshold_percent(mut self, percent: f64) -> Self {
        self.queue_full_threshold_percent = percent;
        self
    }

    /// Set tenant requests per minute
    pub fn with_tenant_requests_per_minute(mut self, rpm: u64) -> Self {
        self.tenant_requests_per_minute = rpm;
        self
    }

    /// Set user requests per minute
    pub fn with_user_requests_per_minute(mut self, rpm: u64) -> Self {
        self.user_requests_per_minute = rpm;
        self
    }

    /// Set anonymous requests per minute
    pub fn with_anonymous_requests_per_minute(mut self, rpm: u64) -> Self {
        self.anonymous_requests_per_minute = rpm;
        self
    }

    /// Set protected-call deadline
    pub fn with_breaker_timeout(mut self, timeout: Duration) -> Self {
        self.breaker_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set failure-rate threshold percent
    pub fn with_failure_rate_threshold_percent(mut self, percent: f64) -> Self {
        self.failure_rate_threshold_percent = percent;
        self
    }

    /// Set request-volume threshold
    pub fn with_request_volume_threshold(mut self, volume: u64) -> Self {
        self.request_volume_threshold = volume;
        self
    }

    /// Set open cooldown
    pub fn with_open_cooldown(mut self, cooldown: Duration) -> Self {
        self.open_cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    /// Set cache staleness limit
    pub fn with_cache_staleness_limit(mut self, limit: Duration) -> Self {
        self.cache_staleness_limit_ms = limit.as_millis() as u64;
        self
    }

    /// Set half-open trial concurrency
    pub fn with_half_open_max_trials(mut self, trials: u32) -> Self {
        self.half_open_max_trials = trials;
        self
    }

    /// Set half-open success threshold
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set rolling window length
    pub fn with_rolling_window(mut self, window: Duration) -> Self {
        self.rolling_window_ms = window.as_millis() as u64;
        self
    }

    /// Set spillover byte budget
    pub fn with_spillover_max_bytes(mut self, bytes: u64) -> Self {
        self.spillover_max_bytes = bytes;
        self
    }

    /// Set store retry interval
    pub fn with_store_retry_interval(mut self, interval: Duration) -> Self {
        self.store_retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Check option ranges
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.queue_full_threshold_percent) {
            return Err(ResilienceError::invalid_config(format!(
                "queueFullThresholdPercent must be within 0..=100, got {}",
                self.queue_full_threshold_percent
            )));
        }
        if !(0.0..=100.0).contains(&self.failure_rate_threshold_percent)
            || self.failure_rate_threshold_percent == 0.0
        {
            return Err(ResilienceError::invalid_config(format!(
                "failureRateThresholdPercent must be within (0, 100], got {}",
                self.failure_rate_threshold_percent
            )));
        }
        if self.request_volume_threshold == 0 {
            return Err(ResilienceError::invalid_config(
                "requestVolumeThreshold must be at least 1",
            ));
        }
        if self.breaker_timeout_ms == 0 {
            return Err(ResilienceError::invalid_config(
                "breakerTimeoutMs must be positive",
            ));
        }
        if self.half_open_max_trials == 0 || self.success_threshold == 0 {
            return Err(ResilienceError::invalid_config(
                "halfOpenMaxTrials and successThreshold must be at least 1",
            ));
        }
        if self.rolling_window_ms == 0 {
            return Err(ResilienceError::invalid_config(
                "rollingWindowMs must be positive",
            ));
        }
        if self.fallback_spillover_path.as_os_str().is_empty() {
            return Err(ResilienceError::invalid_config(
                "fallbackSpilloverPath must not be empty",
            ));
        }
        Ok(())
    }

    /// Bucket shape for tenant scopes
    pub fn tenant_limit(&self) -> RateLimiterConfig {
        RateLimiterConfig::per_minute(self.tenant_requests_per_minute)
    }

    /// Bucket shape for user scopes
    pub fn user_limit(&self) -> RateLimiterConfig {
        RateLimiterConfig::per_minute(self.user_requests_per_minute)
    }

    /// Bucket shape for the anonymous scope
    pub fn anonymous_limit(&self) -> RateLimiterConfig {
        RateLimiterConfig::per_minute(self.anonymous_requests_per_minute)
    }

    /// Breaker settings shared by every protected operation
    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_rate_threshold(self.failure_rate_threshold_percent / 100.0)
            .with_request_volume_threshold(self.request_volume_threshold)
            .with_cooldown(Duration::from_millis(self.open_cooldown_ms))
            .with_call_timeout(Duration::from_millis(self.breaker_timeout_ms))
            .with_half_open_max_trials(self.half_open_max_trials)
            .with_success_threshold(self.success_threshold)
            .with_rolling_window(Duration::from_millis(self.rolling_window_ms))
    }

    /// Spillover writer settings
    pub fn spillover(&self) -> SpilloverConfig {
        SpilloverConfig::new(self.fallback_spillover_path.clone())
            .with_max_bytes(self.spillover_max_bytes)
    }

    /// Cache staleness limit as a duration
    pub fn cache_staleness_limit(&self) -> Duration {
        Duration::from_millis(self.cache_staleness_limit_ms)
    }

    /// Fail-open window as a duration
    pub fn store_retry_interval(&self) -> Duration {
        Duration::from_millis(self.store_retry_interval_ms)
    }
}
