//! Bounded ingress queue
//!
//! Provides the bounded work queue that sits between admission and the
//! protected pipeline stages. The admission layer never mutates it; it only
//! observes depth through [`QueueProbe`].

use crate::error::{ResilienceError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{timeout, Duration};

/// Raw depth reading of a bounded queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepth {
    /// Items currently waiting
    pub size: u64,
    /// Maximum number of items the queue holds
    pub capacity: u64,
    /// Consumers currently attached
    pub active_consumers: u64,
}

/// Read-only view of a queue's depth
///
/// Implementations must not block; an inspection failure is reported as an
/// error and handled by the caller.
pub trait QueueProbe: Send + Sync {
    /// Read the current depth
    fn probe(&self) -> Result<QueueDepth>;
}

/// Configuration for a bounded queue
#[derive(Debug, Clone)]
pub struct BoundedQueueConfig {
    /// Maximum number of items in queue
    pub max_size: usize,
    /// Timeout for enqueue operation when queue is full
    pub enqueue_timeout: Duration,
}

impl Default for BoundedQueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            enqueue_timeout: Duration::from_secs(5),
        }
    }
}

impl BoundedQueueConfig {
    /// Create a new configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum queue size
    #[must_use]
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set enqueue timeout
    #[must_use]
    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }
}

/// Async bounded queue with depth accounting
///
/// # Example
///
/// ```no_run
/// use rust_resilience_system::core::{BoundedQueue, BoundedQueueConfig, QueueProbe};
///
/// # async fn example() -> rust_resilience_system::Result<()> {
/// let queue = BoundedQueue::new(BoundedQueueConfig::new().with_max_size(100));
/// queue.enqueue("span-batch-1").await?;
///
/// let depth = queue.probe()?;
/// assert_eq!(depth.size, 1);
/// assert_eq!(depth.capacity, 100);
/// # Ok(())
/// # }
/// ```
pub struct BoundedQueue<T> {
    config: BoundedQueueConfig,
    tx: mpsc::Sender<T>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
    semaphore: Arc<Semaphore>,
    enqueued_count: AtomicU64,
    dequeued_count: AtomicU64,
    consumers: Arc<AtomicU64>,
}

impl<T: Send> BoundedQueue<T> {
    /// Create a new bounded queue
    pub fn new(config: BoundedQueueConfig) -> Self {
        // mpsc::channel panics on zero capacity; the semaphore still enforces the real bound
        let (tx, rx) = mpsc::channel(config.max_size.max(1));
        let semaphore = Arc::new(Semaphore::new(config.max_size));

        Self {
            config,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            semaphore,
            enqueued_count: AtomicU64::new(0),
            dequeued_count: AtomicU64::new(0),
            consumers: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue an item, waiting up to `enqueue_timeout` for space
    ///
    /// # Errors
    ///
    /// Returns error if the queue stays full past the timeout or is closed.
    pub async fn enqueue(&self, item: T) -> Result<()> {
        let permit = timeout(self.config.enqueue_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| ResilienceError::other("Enqueue timeout: queue full"))?
            .map_err(|_| ResilienceError::other("Queue semaphore closed"))?;

        self.tx
            .send(item)
            .await
            .map_err(|_| ResilienceError::other("Queue closed"))?;

        self.enqueued_count.fetch_add(1, Ordering::Relaxed);

        // Forget permit to keep it acquired until dequeue
        permit.forget();

        Ok(())
    }

    /// Try to enqueue without blocking
    pub fn try_enqueue(&self, item: T) -> Result<()> {
        let permit = self
            .semaphore
            .try_acquire()
            .map_err(|_| ResilienceError::other("Queue full"))?;

        self.tx
            .try_send(item)
            .map_err(|_| ResilienceError::other("Queue closed"))?;

        self.enqueued_count.fetch_add(1, Ordering::Relaxed);
        permit.forget();

        Ok(())
    }

    /// Dequeue an item, waiting until one is available
    pub async fn dequeue(&self) -> Option<T> {
        let mut rx_guard = self.rx.lock().await;
        let item = rx_guard.recv().await;

        if item.is_some() {
            self.dequeued_count.fetch_add(1, Ordering::Relaxed);
            self.semaphore.add_permits(1);
        }

        item
    }

    /// Try to dequeue without blocking
    pub fn try_dequeue(&self) -> Option<T> {
        let mut rx_guard = self.rx.try_lock().ok()?;
        let item = rx_guard.try_recv().ok();

        if item.is_some() {
            self.dequeued_count.fetch_add(1, Ordering::Relaxed);
            self.semaphore.add_permits(1);
        }

        item
    }

    /// Attach a consumer; it is counted until the guard is dropped
    pub fn register_consumer(&self) -> ConsumerGuard {
        self.consumers.fetch_add(1, Ordering::AcqRel);
        ConsumerGuard {
            consumers: Arc::clone(&self.consumers),
        }
    }

    /// Current number of waiting items
    #[must_use]
    pub fn len(&self) -> u64 {
        let enqueued = self.enqueued_count.load(Ordering::Relaxed);
        let dequeued = self.dequeued_count.load(Ordering::Relaxed);
        enqueued.saturating_sub(dequeued)
    }

    /// Check if queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if queue is full
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

impl<T: Send> QueueProbe for BoundedQueue<T> {
    fn probe(&self) -> Result<QueueDepth> {
        Ok(QueueDepth {
            size: self.len(),
            capacity: self.config.max_size as u64,
            active_consumers: self.consumers.load(Ordering::Acquire),
        })
    }
}

/// RAII registration of a queue consumer
pub struct ConsumerGuard {
    consumers: Arc<AtomicU64>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.consumers.fetch_sub(1, Ordering::AcqRel);
    }
}
