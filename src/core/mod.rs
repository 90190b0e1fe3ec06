//! Core building blocks: time source and the bounded ingress queue

pub mod clock;
pub mod queue;

pub use clock::{Clock, ManualClock, SystemClock};
pub use queue::{BoundedQueue, BoundedQueueConfig, ConsumerGuard, QueueDepth, QueueProbe};
