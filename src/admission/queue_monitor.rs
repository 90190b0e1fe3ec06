//! Queue depth observation
//!
//! The monitor reads registered queues through [`QueueProbe`] and never
//! mutates them. Any inspection failure is treated as "not over threshold"
//! so a broken probe cannot take ingress down with it.

use crate::core::QueueProbe;
use crate::error::{ResilienceError, Result};
use crate::telemetry;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Point-in-time depth of one named queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    /// Queue name
    pub name: String,
    /// Items waiting
    pub size: u64,
    /// Maximum items
    pub capacity: u64,
    /// Consumers attached
    pub active_consumers: u64,
    /// `size / capacity` as a percentage; a zero-capacity queue reads as 100
    pub utilization_percent: f64,
}

impl QueueSnapshot {
    fn new(name: &str, size: u64, capacity: u64, active_consumers: u64) -> Self {
        let utilization_percent = if capacity == 0 {
            100.0
        } else {
            size as f64 * 100.0 / capacity as f64
        };

        Self {
            name: name.to_string(),
            size,
            capacity,
            active_consumers,
            utilization_percent,
        }
    }

    /// Whether utilization is strictly above `threshold_percent`
    pub fn is_over(&self, threshold_percent: f64) -> bool {
        self.utilization_percent > threshold_percent
    }
}

/// Registry of observable queues
#[derive(Default)]
pub struct QueueMonitor {
    queues: RwLock<HashMap<String, Arc<dyn QueueProbe>>>,
    degraded_observations: AtomicU64,
}

impl QueueMonitor {
    /// Create an empty monitor
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue under `name`, replacing any previous probe
    pub fn register(&self, name: impl Into<String>, probe: Arc<dyn QueueProbe>) {
        let name = name.into();
        tracing::debug!(queue = %name, "queue registered for monitoring");
        self.queues.write().insert(name, probe);
    }

    /// Stop observing `name`
    pub fn unregister(&self, name: &str) -> bool {
        self.queues.write().remove(name).is_some()
    }

    /// Read the depth of one queue
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::UnknownQueue`] if nothing is registered
    /// under `name`, or the probe's own error.
    pub fn snapshot(&self, name: &str) -> Result<QueueSnapshot> {
        let probe = self
            .queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ResilienceError::UnknownQueue(name.to_string()))?;

        let depth = probe.probe()?;
        Ok(QueueSnapshot::new(
            name,
            depth.size,
            depth.capacity,
            depth.active_consumers,
        ))
    }

    /// Whether `name` is above `threshold_percent`
    ///
    /// Fails open: if the queue cannot be inspected the answer is `false`
    /// and a degraded observation is counted.
    pub fn is_over_threshold(&self, name: &str, threshold_percent: f64) -> bool {
        match self.snapshot(name) {
            Ok(snapshot) => snapshot.is_over(threshold_percent),
            Err(err) => {
                self.degraded_observations.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::QUEUE_DEGRADED_OBSERVATIONS).increment(1);
                tracing::warn!(
                    queue = name,
                    error = %err,
                    "Queue depth unavailable, admitting (fail-open)"
                );
                false
            }
        }
    }

    /// Statistics of every registered queue that could be read, sorted by name
    pub fn all_snapshots(&self) -> Vec<QueueSnapshot> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();

        names
            .iter()
            .filter_map(|name| match self.snapshot(name) {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    tracing::warn!(queue = %name, error = %err, "skipping unreadable queue");
                    None
                }
            })
            .collect()
    }

    /// Inspections that failed and were treated as "not over threshold"
    pub fn degraded_observations(&self) -> u64 {
        self.degraded_observations.load(Ordering::Relaxed)
    }

    /// Number of registered queues
    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    /// Check if no queue is registered
    pub fn is_empty(&self) -> bool {
        self.queues.read().is_empty()
    }
}
