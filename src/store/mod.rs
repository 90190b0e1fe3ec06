//! Shared atomic state store
//!
//! Bucket and breaker records live in a store that is owned outside the
//! limiter and breaker. Access goes through a narrow load / compare-and-swap
//! interface so the same algorithms stay correct whether the store is the
//! in-process [`InMemoryStore`] or an external key-value service shared by
//! several processes.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::core::{Clock, SystemClock};

/// State store errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached
    #[error("State store unreachable: {0}")]
    Unavailable(String),

    /// Too many concurrent writers raced on the same key
    #[error("Compare-and-swap contention on key '{0}'")]
    Contention(String),
}

/// A stored value together with its version
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<V> {
    /// Stored value
    pub value: V,
    /// Monotonic per-key version, bumped on every successful swap
    pub version: u64,
}

/// Result of a compare-and-swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The value was written; carries the new version
    Swapped(u64),
    /// Another writer got there first
    Conflict,
}

/// Narrow atomic key-value interface
///
/// `expected` is the version observed by the preceding [`load`](StateStore::load),
/// or `None` when the key was absent. A swap only succeeds when the key is
/// still at that version, which makes load-modify-swap an indivisible update
/// per key.
pub trait StateStore<V>: Send + Sync {
    /// Load the current value of `key`
    fn load(&self, key: &str) -> Result<Option<Versioned<V>>, StoreError>;

    /// Replace the value of `key` if it is still at `expected`
    ///
    /// `ttl` sets the passive expiry of the record; `None` keeps it forever.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: V,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome, StoreError>;

    /// List live keys
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

struct Entry<V> {
    value: V,
    version: u64,
    expires_at_ms: Option<u64>,
}

/// In-process store with passive expiry
///
/// Expired records are invisible to [`load`](StateStore::load) and are
/// physically removed by [`sweep_expired`](InMemoryStore::sweep_expired).
pub struct InMemoryStore<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    clock: Arc<dyn Clock>,
    offline: AtomicBool,
}

impl<V: Clone + Send + Sync> InMemoryStore<V> {
    /// Create an empty store on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store on a custom clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every call fails with [`StoreError::Unavailable`]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Remove records past their expiry, returning how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !Self::is_expired(entry, now));
        before - entries.len()
    }

    /// Start a background task that sweeps expired records every `interval`
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()>
    where
        V: 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                let removed = self.sweep_expired();
                if removed > 0 {
                    tracing::debug!(removed, "swept expired state records");
                }
            }
        })
    }

    /// Number of physically held records, expired or not
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the store holds no records
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn is_expired(entry: &Entry<V>, now_ms: u64) -> bool {
        entry.expires_at_ms.is_some_and(|at| now_ms >= at)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::Acquire) {
            Err(StoreError::Unavailable("in-memory store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl<V: Clone + Send + Sync> Default for InMemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> StateStore<V> for InMemoryStore<V> {
    fn load(&self, key: &str) -> Result<Option<Versioned<V>>, StoreError> {
        self.check_online()?;
        let now = self.clock.now_ms();
        let entries = self.entries.read();

        Ok(entries
            .get(key)
            .filter(|entry| !Self::is_expired(entry, now))
            .map(|entry| Versioned {
                value: entry.value.clone(),
                version: entry.version,
            }))
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: V,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome, StoreError> {
        self.check_online()?;
        let now = self.clock.now_ms();
        let mut entries = self.entries.write();

        // An expired record counts as absent, but its version keeps counting up
        let (current, last_version) = match entries.get(key) {
            Some(entry) if Self::is_expired(entry, now) => (None, entry.version),
            Some(entry) => (Some(entry.version), entry.version),
            None => (None, 0),
        };

        if current != expected {
            return Ok(CasOutcome::Conflict);
        }

        let version = last_version + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at_ms: ttl.map(|ttl| now.saturating_add(ttl.as_millis() as u64)),
            },
        );

        Ok(CasOutcome::Swapped(version))
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        let now = self.clock.now_ms();
        let entries = self.entries.read();

        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !Self::is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;

    #[test]
    fn test_insert_and_load() {
        let store = InMemoryStore::new();
        assert_eq!(store.load("a").unwrap(), None);

        let outcome = store.compare_and_swap("a", None, 7u32, None).unwrap();
        assert_eq!(outcome, CasOutcome::Swapped(1));

        let loaded = store.load("a").unwrap().unwrap();
        assert_eq!(loaded.value, 7);
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn test_stale_version_conflicts() {
        let store = InMemoryStore::new();
        store.compare_and_swap("a", None, 1u32, None).unwrap();
        store.compare_and_swap("a", Some(1), 2u32, None).unwrap();

        // Writer that still believes version 1 is current loses
        assert_eq!(
            store.compare_and_swap("a", Some(1), 99u32, None).unwrap(),
            CasOutcome::Conflict
        );
        // Writer that believes the key is absent loses too
        assert_eq!(
            store.compare_and_swap("a", None, 99u32, None).unwrap(),
            CasOutcome::Conflict
        );
        assert_eq!(store.load("a").unwrap().unwrap().value, 2);
    }

    #[test]
    fn test_passive_expiry() {
        let clock = ManualClock::new(0);
        let store = InMemoryStore::with_clock(Arc::new(clock.clone()));

        store
            .compare_and_swap("bucket", None, 5u32, Some(Duration::from_secs(120)))
            .unwrap();
        assert!(store.load("bucket").unwrap().is_some());

        clock.advance(Duration::from_secs(120));
        assert!(store.load("bucket").unwrap().is_none());
        assert!(store.keys().unwrap().is_empty());

        // Expired key can be recreated as if absent
        let outcome = store
            .compare_and_swap("bucket", None, 6u32, Some(Duration::from_secs(120)))
            .unwrap();
        assert_eq!(outcome, CasOutcome::Swapped(2));
    }

    #[test]
    fn test_sweep_expired() {
        let clock = ManualClock::new(0);
        let store = InMemoryStore::with_clock(Arc::new(clock.clone()));

        store
            .compare_and_swap("short", None, 1u32, Some(Duration::from_secs(1)))
            .unwrap();
        store.compare_and_swap("forever", None, 2u32, None).unwrap();

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.len(), 2);
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.keys().unwrap(), vec!["forever".to_string()]);
    }

    #[tokio::test]
    async fn test_background_sweeper() {
        let clock = ManualClock::new(0);
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        store
            .compare_and_swap("idle", None, 1u32, Some(Duration::from_secs(1)))
            .unwrap();
        clock.advance(Duration::from_secs(2));

        let handle = Arc::clone(&store).spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert!(store.is_empty());
    }

    #[test]
    fn test_offline_store() {
        let store: InMemoryStore<u32> = InMemoryStore::new();
        store.set_offline(true);

        assert!(matches!(store.load("a"), Err(StoreError::Unavailable(_))));
        assert!(store.compare_and_swap("a", None, 1, None).is_err());

        store.set_offline(false);
        assert!(store.load("a").is_ok());
    }
}
