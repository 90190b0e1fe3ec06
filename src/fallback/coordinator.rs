//! Degraded paths for failing downstreams
//!
//! Reads fall back to a recent cached result, or to an explicit empty
//! result. Writes fall back to local spillover and are replayed once the
//! breaker closes again. Only a failure of the spillover itself surfaces as
//! an error.

use super::cache::{ResultCache, ResultCacheConfig};
use super::spillover::{SpillRecord, SpilloverWriter};
use crate::core::Clock;
use crate::error::{ResilienceError, Result};
use crate::stability::{CircuitBreakerError, CircuitBreakerRegistry, CircuitState};
use crate::telemetry;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Where a degraded result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DegradedSource {
    /// Last known good result within the staleness limit
    Cached,
    /// The write was stored locally for replay
    SpilloverQueued,
    /// Nothing usable was available
    Empty,
}

impl DegradedSource {
    /// Label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradedSource::Cached => "cached",
            DegradedSource::SpilloverQueued => "spillover_queued",
            DegradedSource::Empty => "empty",
        }
    }
}

/// Stand-in for a result the downstream could not produce
#[derive(Debug, Clone, PartialEq)]
pub struct DegradedResult<T> {
    /// Correlation key of the request
    pub correlation_key: String,
    /// Where the stand-in came from
    pub source: DegradedSource,
    /// Cached value, if any
    pub value: Option<T>,
}

impl<T> DegradedResult<T> {
    /// Always true; lets callers branch on a degraded result uniformly
    pub fn is_degraded(&self) -> bool {
        true
    }
}

/// Result of a protected call with fallback
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The downstream answered
    Success(T),
    /// The downstream did not answer; a stand-in was produced
    Degraded(DegradedResult<T>),
}

impl<T> Outcome<T> {
    /// Whether this is a degraded result
    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded(_))
    }

    /// The real or cached value, if any
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Success(value) => Some(value),
            Outcome::Degraded(degraded) => degraded.value.as_ref(),
        }
    }

    /// Source of a degraded result
    pub fn degraded_source(&self) -> Option<DegradedSource> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Degraded(degraded) => Some(degraded.source),
        }
    }
}

/// Re-delivers spilled writes
#[async_trait]
pub trait ReplayHandler: Send + Sync {
    /// Error reported by the downstream
    type Error: fmt::Display + Send;

    /// Deliver one spilled record
    async fn replay(&self, record: &SpillRecord) -> std::result::Result<(), Self::Error>;
}

/// Outcome of a replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Records delivered and deleted
    pub replayed: usize,
    /// Unreadable files moved aside
    pub quarantined: usize,
    /// Files left in place because they belong to another breaker
    pub foreign: usize,
    /// Files still waiting
    pub remaining: usize,
    /// The breaker was not closed, so nothing was attempted
    pub skipped: bool,
}

/// Coordinates cached reads, spilled writes and replay per breaker
pub struct FallbackCoordinator {
    breakers: Arc<CircuitBreakerRegistry>,
    cache: Arc<ResultCache<serde_json::Value>>,
    spillover: SpilloverWriter,
    replay_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FallbackCoordinator {
    /// Create a coordinator
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        cache_config: ResultCacheConfig,
        spillover: SpilloverWriter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            breakers,
            cache: Arc::new(ResultCache::new(cache_config, clock)),
            spillover,
            replay_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Breakers guarding the protected operations
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Spillover storage
    pub fn spillover(&self) -> &SpilloverWriter {
        &self.spillover
    }

    /// Result cache
    pub fn cache(&self) -> &ResultCache<serde_json::Value> {
        &self.cache
    }

    /// Start a background task dropping cached results past the staleness limit
    pub fn start_cache_cleanup(&self, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        Arc::clone(&self.cache).start_cleanup(interval)
    }

    /// Run a read behind `breaker`, falling back to the cache
    pub async fn read<T, E, Fut>(&self, breaker: &str, correlation_key: &str, operation: Fut) -> Outcome<T>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let cache_key = cache_key(breaker, correlation_key);

        let err = match self.breakers.breaker(breaker).call(operation).await {
            Ok(value) => {
                match serde_json::to_value(&value) {
                    Ok(json) => self.cache.insert(cache_key, json),
                    Err(err) => {
                        tracing::debug!(breaker, error = %err, "result not cacheable");
                    }
                }
                return Outcome::Success(value);
            }
            Err(err) => err,
        };

        tracing::warn!(breaker, correlation_key, error = %describe(&err), "read degraded");

        let cached = self
            .cache
            .get_fresh(&cache_key)
            .and_then(|hit| serde_json::from_value::<T>(hit.value).ok());

        let source = if cached.is_some() {
            DegradedSource::Cached
        } else {
            DegradedSource::Empty
        };
        metrics::counter!(telemetry::FALLBACK_SERVED, "source" => source.as_str()).increment(1);

        Outcome::Degraded(DegradedResult {
            correlation_key: correlation_key.to_string(),
            source,
            value: cached,
        })
    }

    /// Run a write behind `breaker`, spilling `payload` if it cannot be delivered
    ///
    /// # Errors
    ///
    /// [`ResilienceError::LocalOverflowFull`] when spillover has no room,
    /// [`ResilienceError::PartialDegradation`] when spilling failed otherwise.
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
        let err = match self.breakers.breaker(breaker).call(operation).await {
            Ok(()) => return Ok(Outcome::Success(())),
            Err(err) => err,
        };

        tracing::warn!(breaker, correlation_key, error = %describe(&err), "write degraded, spilling");

        match self.spillover.spill(breaker, correlation_key, payload).await {
            Ok(_) => {
                metrics::counter!(
                    telemetry::FALLBACK_SERVED,
                    "source" => DegradedSource::SpilloverQueued.as_str()
                )
                .increment(1);
                Ok(Outcome::Degraded(DegradedResult {
                    correlation_key: correlation_key.to_string(),
                    source: DegradedSource::SpilloverQueued,
                    value: None,
                }))
            }
            Err(full @ ResilienceError::LocalOverflowFull { .. }) => {
                tracing::error!(breaker, correlation_key, error = %full, "local overflow full, write lost");
                Err(full)
            }
            Err(spill_err) => {
                tracing::error!(
                    breaker,
                    correlation_key,
                    error = %spill_err,
                    "spillover failed after downstream failure"
                );
                Err(ResilienceError::partial_degradation(
                    breaker,
                    format!("{}; spillover failed: {}", describe(&err), spill_err),
                ))
            }
        }
    }

    /// Replay spilled writes of `breaker`, oldest first
    ///
    /// Nothing happens unless the breaker is closed. Each record goes
    /// through the breaker, is deleted once delivered, and the pass stops at
    /// the first delivery failure. Passes over the same breaker run one at a
    /// time.
    pub async fn replay_spillover<H: ReplayHandler>(&self, breaker: &str, handler: &H) -> Result<ReplayReport> {
        let replay_lock = self.replay_lock(breaker);
        let _replaying = replay_lock.lock().await;

        let guard = self.breakers.breaker(breaker);
        let pending = self.spillover.list(breaker).await?;

        if guard.state() != CircuitState::Closed {
            tracing::debug!(breaker, pending = pending.len(), "replay skipped, breaker not closed");
            return Ok(ReplayReport {
                remaining: pending.len(),
                skipped: true,
                ..ReplayReport::default()
            });
        }

        let mut report = ReplayReport::default();
        let total = pending.len();

        for path in pending {
            let record = match self.spillover.read(&path).await {
                Ok(record) => record,
                Err(ResilienceError::CorruptSpill(_)) => {
                    self.spillover.quarantine(&path).await?;
                    report.quarantined += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            if record.breaker != breaker {
                tracing::warn!(
                    breaker,
                    owner = %record.breaker,
                    path = %path.display(),
                    "spill file belongs to another breaker, leaving it in place"
                );
                report.foreign += 1;
                continue;
            }

            match guard.call(handler.replay(&record)).await {
                Ok(()) => {
                    self.spillover.remove(&path).await?;
                    report.replayed += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        breaker,
                        correlation_key = %record.correlation_key,
                        error = %describe(&err),
                        "replay stopped"
                    );
                    break;
                }
            }
        }

        report.remaining = total - report.replayed - report.quarantined;
        if report.replayed > 0 {
            tracing::info!(breaker, replayed = report.replayed, remaining = report.remaining, "spillover replayed");
        }
        Ok(report)
    }

    fn replay_lock(&self, breaker: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.replay_locks.lock();
        Arc::clone(locks.entry(breaker.to_string()).or_default())
    }
}

fn cache_key(breaker: &str, correlation_key: &str) -> String {
    format!("{}:{}", breaker, correlation_key)
}

fn describe<E: fmt::Display>(err: &CircuitBreakerError<E>) -> String {
    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::fallback::SpilloverConfig;
    use crate::stability::{BreakerRecord, CircuitBreakerConfig};
    use crate::store::InMemoryStore;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::time::Duration;

    fn coordinator(dir: &Path, max_bytes: u64) -> (FallbackCoordinator, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store: Arc<InMemoryStore<BreakerRecord>> =
            Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::new()
                .with_request_volume_threshold(2)
                .with_cooldown(Duration::from_secs(5)),
            store,
            Arc::new(clock.clone()),
        ));
        let spillover = SpilloverWriter::new(
            SpilloverConfig::new(dir).with_max_bytes(max_bytes),
            Arc::new(clock.clone()),
        );
        let coordinator = FallbackCoordinator::new(
            breakers,
            ResultCacheConfig::new().with_staleness_limit(Duration::from_secs(30)),
            spillover,
            Arc::new(clock.clone()),
        );
        (coordinator, clock)
    }

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl ReplayHandler for Recorder {
        type Error = String;

        async fn replay(&self, record: &SpillRecord) -> std::result::Result<(), String> {
            if self.fail_on.as_deref() == Some(record.correlation_key.as_str()) {
                return Err("still down".to_string());
            }
            self.delivered.lock().push(record.correlation_key.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_read_serves_fresh_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, clock) = coordinator(dir.path(), 1 << 20);

        let ok = coordinator
            .read("rules", "req-1", async { Ok::<_, String>(vec![1u32, 2]) })
            .await;
        assert_eq!(ok, Outcome::Success(vec![1, 2]));

        clock.advance(Duration::from_secs(10));
        let degraded = coordinator
            .read("rules", "req-1", async { Err::<Vec<u32>, _>("boom") })
            .await;
        assert_eq!(degraded.degraded_source(), Some(DegradedSource::Cached));
        assert_eq!(degraded.value(), Some(&vec![1, 2]));
    }

    #[tokio::test]
    async fn test_read_stale_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, clock) = coordinator(dir.path(), 1 << 20);

        coordinator
            .read("rules", "req-1", async { Ok::<_, String>(7u32) })
            .await;
        clock.advance(Duration::from_secs(31));

        let degraded = coordinator
            .read("rules", "req-1", async { Err::<u32, _>("boom") })
            .await;
        match degraded {
            Outcome::Degraded(result) => {
                assert!(result.is_degraded());
                assert_eq!(result.source, DegradedSource::Empty);
                assert_eq!(result.value, None);
                assert_eq!(result.correlation_key, "req-1");
            }
            Outcome::Success(_) => panic!("expected degraded result"),
        }
    }

    #[tokio::test]
    async fn test_write_spills_while_open() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), 1 << 20);

        for key in ["w-1", "w-2"] {
            let outcome = coordinator
                .write("ledger", key, &key, async { Err::<(), _>("down") })
                .await
                .unwrap();
            assert_eq!(outcome.degraded_source(), Some(DegradedSource::SpilloverQueued));
        }
        assert_eq!(
            coordinator.breakers().breaker("ledger").state(),
            CircuitState::Open
        );

        // Open breaker: short-circuited, still spilled
        let outcome = coordinator
            .write("ledger", "w-3", &"w-3", async { Ok::<(), String>(()) })
            .await
            .unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(coordinator.spillover().list("ledger").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_write_overflow_full() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), 10);

        let err = coordinator
            .write("ledger", "w-1", &"payload", async { Err::<(), _>("down") })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::LocalOverflowFull { .. }));
    }

    #[tokio::test]
    async fn test_write_spill_failure_is_partial_degradation() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the spillover directory should be
        let blocker = dir.path().join("spill");
        std::fs::write(&blocker, b"").unwrap();
        let (coordinator, _) = coordinator(&blocker, 1 << 20);

        let err = coordinator
            .write("ledger", "w-1", &"payload", async { Err::<(), _>("down") })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::PartialDegradation { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_replay_waits_for_closed_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, clock) = coordinator(dir.path(), 1 << 20);

        for key in ["w-1", "w-2", "w-3"] {
            coordinator
                .write("ledger", key, &key, async { Err::<(), _>("down") })
                .await
                .unwrap();
        }

        let recorder = Recorder::default();
        let report = coordinator.replay_spillover("ledger", &recorder).await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.remaining, 3);
        assert!(recorder.delivered.lock().is_empty());

        // Recover: cooldown passes and a trial succeeds
        clock.advance(Duration::from_secs(5));
        coordinator
            .write("ledger", "probe", &"probe", async { Ok::<(), String>(()) })
            .await
            .unwrap();
        assert_eq!(
            coordinator.breakers().breaker("ledger").state(),
            CircuitState::Closed
        );

        let report = coordinator.replay_spillover("ledger", &recorder).await.unwrap();
        assert_eq!(report.replayed, 3);
        assert_eq!(report.remaining, 0);
        assert_eq!(*recorder.delivered.lock(), vec!["w-1", "w-2", "w-3"]);
        assert!(coordinator.spillover().list("ledger").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, clock) = coordinator(dir.path(), 1 << 20);

        for key in ["w-1", "w-2", "w-3"] {
            coordinator
                .write("ledger", key, &key, async { Err::<(), _>("down") })
                .await
                .unwrap();
        }
        clock.advance(Duration::from_secs(5));
        coordinator.breakers().breaker("ledger").reset();

        let recorder = Recorder {
            fail_on: Some("w-2".to_string()),
            ..Recorder::default()
        };
        let report = coordinator.replay_spillover("ledger", &recorder).await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 2);
        assert_eq!(*recorder.delivered.lock(), vec!["w-1"]);
    }

    #[tokio::test]
    async fn test_replay_only_delivers_own_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), 1 << 20);

        coordinator
            .write("ledger.v1", "dotted", &"dotted", async { Err::<(), _>("down") })
            .await
            .unwrap();
        coordinator
            .write("ledger_v1", "underscored", &"underscored", async { Err::<(), _>("down") })
            .await
            .unwrap();

        let recorder = Recorder::default();
        let report = coordinator.replay_spillover("ledger_v1", &recorder).await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(*recorder.delivered.lock(), vec!["underscored"]);
        assert_eq!(coordinator.spillover().list("ledger.v1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_leaves_foreign_record_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), 1 << 20);

        let own = coordinator
            .spillover()
            .spill("ledger", "own", &"own")
            .await
            .unwrap();
        let stray = coordinator
            .spillover()
            .spill("billing", "stray", &"stray")
            .await
            .unwrap();

        // A billing record that ended up in the ledger directory
        let misplaced = own.path.with_file_name("99999999999999999999.spill");
        std::fs::rename(&stray.path, &misplaced).unwrap();

        let recorder = Recorder::default();
        let report = coordinator.replay_spillover("ledger", &recorder).await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.foreign, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(*recorder.delivered.lock(), vec!["own"]);
        assert!(misplaced.exists());
    }

    #[tokio::test]
    async fn test_concurrent_replays_deliver_once() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator(dir.path(), 1 << 20);

        for key in ["a", "b", "c"] {
            coordinator
                .spillover()
                .spill("ledger", key, &key)
                .await
                .unwrap();
        }

        let recorder = Recorder::default();
        let (first, second) = tokio::join!(
            coordinator.replay_spillover("ledger", &recorder),
            coordinator.replay_spillover("ledger", &recorder)
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.replayed + second.replayed, 3);
        assert_eq!(*recorder.delivered.lock(), vec!["a", "b", "c"]);
        assert!(coordinator.spillover().list("ledger").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_cleanup_task_prunes_stale_results() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, clock) = coordinator(dir.path(), 1 << 20);

        coordinator
            .read("rules", "req-1", async { Ok::<_, String>(1u32) })
            .await;
        assert_eq!(coordinator.cache().stats().size, 1);

        let cleanup = coordinator.start_cache_cleanup(Duration::from_secs(1));
        clock.advance(Duration::from_secs(31));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(coordinator.cache().stats().size, 0);
        cleanup.abort();
    }
}
