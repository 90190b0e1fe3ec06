//! Metric descriptions
//!
//! Components emit through the `metrics` facade; whichever recorder the host
//! application installs receives them. Calling [`describe_metrics`] once
//! attaches help text and units.

use metrics::{describe_counter, describe_gauge, Unit};
use std::sync::OnceLock;

static DESCRIBED: OnceLock<()> = OnceLock::new();

/// Requests admitted
pub const ADMISSION_ALLOWED: &str = "resilience_admission_allowed_total";
/// Requests rejected, labelled by `reason`
pub const ADMISSION_REJECTED: &str = "resilience_admission_rejected_total";
/// Rate-limit checks answered without the state store
pub const RATELIMIT_DEGRADED: &str = "resilience_ratelimit_degraded_total";
/// Queue inspections that failed open
pub const QUEUE_DEGRADED_OBSERVATIONS: &str = "resilience_queue_degraded_observations_total";
/// Breaker state changes, labelled by `breaker` and `to`
pub const BREAKER_TRANSITIONS: &str = "resilience_breaker_transitions_total";
/// Protected calls passed through while breaker state was unavailable
pub const BREAKER_DEGRADED: &str = "resilience_breaker_degraded_total";
/// Degraded results served, labelled by `source`
pub const FALLBACK_SERVED: &str = "resilience_fallback_total";
/// Spill files awaiting replay
pub const SPILLOVER_FILES: &str = "resilience_spillover_files";

/// Register descriptions for every metric this crate emits
///
/// Safe to call more than once.
pub fn describe_metrics() {
    if DESCRIBED.set(()).is_err() {
        return;
    }

    describe_counter!(ADMISSION_ALLOWED, Unit::Count, "Requests admitted");
    describe_counter!(
        ADMISSION_REJECTED,
        Unit::Count,
        "Requests rejected by backpressure or rate limiting"
    );
    describe_counter!(
        RATELIMIT_DEGRADED,
        Unit::Count,
        "Rate limit checks that failed open because the state store was unusable"
    );
    describe_counter!(
        QUEUE_DEGRADED_OBSERVATIONS,
        Unit::Count,
        "Queue depth reads that failed and were treated as below threshold"
    );
    describe_counter!(
        BREAKER_TRANSITIONS,
        Unit::Count,
        "Circuit breaker state transitions"
    );
    describe_counter!(
        BREAKER_DEGRADED,
        Unit::Count,
        "Protected calls let through without breaker bookkeeping"
    );
    describe_counter!(FALLBACK_SERVED, Unit::Count, "Degraded results produced");
    describe_gauge!(
        SPILLOVER_FILES,
        Unit::Count,
        "Spill files waiting for replay"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_is_idempotent() {
        describe_metrics();
        describe_metrics();
        assert!(DESCRIBED.get().is_some());
    }
}
