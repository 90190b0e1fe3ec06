//! Last-known-good result cache with LRU eviction and a staleness limit

use crate::core::Clock;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Result cache configuration
#[derive(Debug, Clone)]
pub struct ResultCacheConfig {
    /// Maximum number of entries
    pub capacity: usize,
    /// Entries older than this are never served
    pub staleness_limit: Duration,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            staleness_limit: Duration::from_secs(30),
        }
    }
}

impl ResultCacheConfig {
    /// Create a new cache configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set staleness limit
    pub fn with_staleness_limit(mut self, limit: Duration) -> Self {
        self.staleness_limit = limit;
        self
    }
}

struct CacheEntry<V> {
    value: V,
    stored_at_ms: u64,
    hits: u64,
}

/// A cached value together with its age
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult<V> {
    /// The stored value
    pub value: V,
    /// Milliseconds since it was stored
    pub age_ms: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCacheStats {
    /// Current number of entries
    pub size: usize,
    /// Maximum capacity
    pub capacity: usize,
    /// Times a fresh entry was served
    pub total_hits: u64,
}

/// Cache of successful results keyed by correlation key
pub struct ResultCache<V: Clone> {
    config: ResultCacheConfig,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    lru_order: Mutex<VecDeque<String>>,
}

impl<V: Clone> ResultCache<V> {
    /// Create a new cache
    pub fn new(config: ResultCacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: RwLock::new(HashMap::new()),
            lru_order: Mutex::new(VecDeque::new()),
        }
    }

    /// Get a value no older than the staleness limit
    ///
    /// A stale entry is dropped on the way out.
    pub fn get_fresh(&self, key: &str) -> Option<CachedResult<V>> {
        let now = self.clock.now_ms();
        let limit = self.config.staleness_limit.as_millis() as u64;
        let mut entries = self.entries.write();

        let entry = entries.get_mut(key)?;
        let age_ms = now.saturating_sub(entry.stored_at_ms);
        if age_ms > limit {
            entries.remove(key);
            self.forget(key);
            return None;
        }

        entry.hits += 1;
        let value = entry.value.clone();
        drop(entries);

        self.touch(key);
        Some(CachedResult { value, age_ms })
    }

    /// Store a value, evicting the least recently used entry if full
    pub fn insert(&self, key: impl Into<String>, value: V) {
        if self.config.capacity == 0 {
            return;
        }

        let key = key.into();
        let now = self.clock.now_ms();
        let mut entries = self.entries.write();

        if entries.len() >= self.config.capacity && !entries.contains_key(&key) {
            if let Some(oldest) = self.lru_order.lock().pop_front() {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key.clone(),
            CacheEntry {
                value,
                stored_at_ms: now,
                hits: 0,
            },
        );
        drop(entries);

        self.touch(&key);
    }

    /// Remove a value
    pub fn remove(&self, key: &str) -> Option<V> {
        let removed = self.entries.write().remove(key).map(|entry| entry.value);
        if removed.is_some() {
            self.forget(key);
        }
        removed
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.entries.write().clear();
        self.lru_order.lock().clear();
    }

    /// Drop entries past the staleness limit
    pub fn prune_stale(&self) -> usize {
        let now = self.clock.now_ms();
        let limit = self.config.staleness_limit.as_millis() as u64;
        let mut entries = self.entries.write();

        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.stored_at_ms) > limit)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            entries.remove(key);
        }
        drop(entries);

        let mut lru = self.lru_order.lock();
        lru.retain(|key| !stale.contains(key));
        stale.len()
    }

    /// Get cache statistics
    pub fn stats(&self) -> ResultCacheStats {
        let entries = self.entries.read();
        ResultCacheStats {
            size: entries.len(),
            capacity: self.config.capacity,
            total_hits: entries.values().map(|entry| entry.hits).sum(),
        }
    }

    /// Start background pruning
    pub fn start_cleanup(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()>
    where
        V: Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                self.prune_stale();
            }
        })
    }

    fn touch(&self, key: &str) {
        let mut lru = self.lru_order.lock();
        if let Some(pos) = lru.iter().position(|k| k == key) {
            lru.remove(pos);
        }
        lru.push_back(key.to_string());
    }

    fn forget(&self, key: &str) {
        let mut lru = self.lru_order.lock();
        if let Some(pos) = lru.iter().position(|k| k == key) {
            lru.remove(pos);
        }
    }
}
