//! Ingress admission: queue backpressure and per-scope rate limiting

pub mod controller;
pub mod queue_monitor;

pub use controller::{Admission, AdmissionController, AdmissionStats, RejectReason};
pub use queue_monitor::{QueueMonitor, QueueSnapshot};
