//! Circuit breaker integration tests

use rust_resilience_system::core::ManualClock;
use rust_resilience_system::stability::BreakerRecord;
use rust_resilience_system::store::InMemoryStore;
use rust_resilience_system::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn registry(config: CircuitBreakerConfig) -> (Arc<CircuitBreakerRegistry>, ManualClock) {
    let clock = ManualClock::new(1_700_000_000_000);
    let store: Arc<InMemoryStore<BreakerRecord>> =
        Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
    let registry = CircuitBreakerRegistry::new(config, store, Arc::new(clock.clone()));
    (Arc::new(registry), clock)
}

async fn downstream(calls: &AtomicU64, fail: bool) -> std::result::Result<u32, String> {
    calls.fetch_add(1, Ordering::SeqCst);
    if fail {
        Err("downstream error".to_string())
    } else {
        Ok(1)
    }
}

#[tokio::test]
async fn test_failure_rate_opens_and_short_circuits() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();

    let (registry, _) = registry(
        CircuitBreakerConfig::new()
            .with_request_volume_threshold(100)
            .with_failure_rate_threshold(0.5),
    );
    let calls = AtomicU64::new(0);

    for i in 0..100 {
        let fail = i < 51;
        registry.call("scoring", downstream(&calls, fail), |_| 0).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 100);
    assert_eq!(registry.state("scoring").unwrap().state, CircuitState::Open);

    let mut fallback_reason = None;
    let value = registry
        .call("scoring", downstream(&calls, false), |err| {
            fallback_reason = Some(matches!(err, CircuitBreakerError::CircuitOpen));
            42
        })
        .await;

    assert_eq!(value, 42);
    assert_eq!(fallback_reason, Some(true));
    assert_eq!(calls.load(Ordering::SeqCst), 100);
}

#[tokio::test]
async fn test_cooldown_then_half_open_trial() {
    let (registry, clock) = registry(
        CircuitBreakerConfig::new()
            .with_request_volume_threshold(1)
            .with_cooldown(Duration::from_secs(30)),
    );
    let calls = AtomicU64::new(0);

    registry.call("kms", downstream(&calls, true), |_| 0).await;
    assert_eq!(registry.state("kms").unwrap().state, CircuitState::Open);

    clock.advance(Duration::from_secs(29));
    registry.call("kms", downstream(&calls, false), |_| 0).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.state("kms").unwrap().state, CircuitState::Open);

    clock.advance(Duration::from_secs(2));
    let breaker = registry.breaker("kms");
    let observed = breaker
        .call(async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<CircuitState, String>(breaker.state())
        })
        .await
        .unwrap();

    assert_eq!(observed, CircuitState::HalfOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let snapshot = registry.state("kms").unwrap();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.request_count, 0);
    assert_eq!(snapshot.failure_count, 0);
}

#[tokio::test]
async fn test_deadline_exceeded_counts_as_failure() {
    let (registry, _) = registry(
        CircuitBreakerConfig::new()
            .with_request_volume_threshold(2)
            .with_call_timeout(Duration::from_millis(20)),
    );

    for _ in 0..2 {
        let result = registry
            .breaker("slow")
            .call(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), String>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Timeout(_))));
    }

    assert_eq!(registry.state("slow").unwrap().state, CircuitState::Open);
}

#[tokio::test]
async fn test_breakers_share_store_across_registries() {
    let clock = ManualClock::new(0);
    let store: Arc<InMemoryStore<BreakerRecord>> =
        Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
    let config = CircuitBreakerConfig::new().with_request_volume_threshold(1);

    // Two workers with their own registries over one store
    let first = CircuitBreakerRegistry::new(config.clone(), store.clone(), Arc::new(clock.clone()));
    let second = CircuitBreakerRegistry::new(config, store, Arc::new(clock.clone()));

    first
        .call("ledger", async { Err::<(), _>("down") }, |_| ())
        .await;

    let calls = AtomicU64::new(0);
    second.call("ledger", downstream(&calls, false), |_| 0).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(second.state("ledger").unwrap().state, CircuitState::Open);
}

#[tokio::test]
async fn test_reset_forces_closed() {
    let dir = tempfile::tempdir().unwrap();
    let config = ResilienceConfig::new(dir.path()).with_request_volume_threshold(1);
    let layer = ResilienceLayer::new(config).unwrap();

    layer
        .call("pricing", async { Err::<u32, _>("down") }, |_| 0)
        .await;
    assert_eq!(
        layer.circuit_breaker_state("pricing").unwrap().state,
        CircuitState::Open
    );

    layer.reset_circuit_breaker("pricing");
    assert_eq!(
        layer.circuit_breaker_state("pricing").unwrap().state,
        CircuitState::Closed
    );
    let states = layer.all_circuit_breaker_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].name, "pricing");
}
