//! Rust Resilience System
//!
//! An admission control and resilience layer for multi-tenant ingest
//! pipelines, built on tokio.
//!
//! ## Features
//!
//! - Queue-depth backpressure with fail-open inspection
//! - Tenant, user and anonymous token buckets over a shared compare-and-swap store
//! - Circuit breakers with failure-rate tripping, cooldown and half-open trials
//! - Call deadlines enforced by the breaker
//! - Cached read fallback and durable write spillover with replay
//! - `tracing` logs and `metrics` counters for every degraded decision
//!
//! ## Example
//!
//! ```no_run
//! use rust_resilience_system::{ResilienceConfig, ResilienceLayer};
//! use rust_resilience_system::core::{BoundedQueue, BoundedQueueConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     rust_resilience_system::telemetry::describe_metrics();
//!
//!     let config = ResilienceConfig::new("/var/lib/ingest/spillover");
//!     let layer = ResilienceLayer::new(config)?;
//!
//!     let queue: Arc<BoundedQueue<Vec<u8>>> = Arc::new(BoundedQueue::new(BoundedQueueConfig::new()));
//!     layer.register_queue("ingest", queue);
//!
//!     let admission = layer.admit("acme", Some("alice"), "ingest");
//!     if !admission.is_accepted() {
//!         println!("retry in {}s", admission.retry_after_secs());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod config;
pub mod core;
pub mod error;
pub mod fallback;
pub mod layer;
pub mod stability;
pub mod store;
pub mod telemetry;

// Re-export main types
pub use admission::{Admission, AdmissionController, QueueMonitor, QueueSnapshot, RejectReason};
pub use config::ResilienceConfig;
pub use error::{ResilienceError, Result};
pub use fallback::{DegradedResult, DegradedSource, FallbackCoordinator, Outcome, ReplayHandler};
pub use layer::ResilienceLayer;
pub use stability::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitBreakerRegistry, CircuitState, RateDecision, RateLimiter, RateLimiterConfig, ScopeKey,
    ScopeLimiter,
};
pub use store::{InMemoryStore, StateStore, StoreError};
