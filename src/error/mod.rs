//! Error types for the resilience system
//!
//! Rejections and degradations are not errors: they are returned as
//! [`RateDecision`](crate::stability::RateDecision),
//! [`Admission`](crate::admission::Admission) and
//! [`Outcome`](crate::fallback::Outcome) values. Only faults that the layer
//! cannot absorb end up here.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for resilience operations
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Resilience system errors
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration rejected at construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Protected operation failed and its safety net failed too
    #[error("Partial degradation on '{breaker}': {reason}")]
    PartialDegradation {
        /// Breaker guarding the failed operation
        breaker: String,
        /// Why the fallback path failed
        reason: String,
    },

    /// Spillover storage has no room left
    #[error("Local overflow full at {path}: {used} of {limit} bytes used")]
    LocalOverflowFull {
        /// Spillover directory
        path: PathBuf,
        /// Bytes currently held in spill files
        used: u64,
        /// Configured byte budget
        limit: u64,
    },

    /// Queue depth could not be read
    #[error("Queue inspection failed for '{queue}': {reason}")]
    QueueInspection {
        /// Queue name
        queue: String,
        /// Underlying failure
        reason: String,
    },

    /// No queue registered under this name
    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Spilled data could not be read back
    #[error("Corrupt spill file {0}")]
    CorruptSpill(PathBuf),

    /// Other errors
    #[error("Resilience error: {0}")]
    Other(String),
}

impl ResilienceError {
    /// Create an invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a partial degradation error
    pub fn partial_degradation<B: Into<String>, S: Into<String>>(breaker: B, reason: S) -> Self {
        Self::PartialDegradation {
            breaker: breaker.into(),
            reason: reason.into(),
        }
    }

    /// Create a queue inspection error
    pub fn queue_inspection<Q: Into<String>, S: Into<String>>(queue: Q, reason: S) -> Self {
        Self::QueueInspection {
            queue: queue.into(),
            reason: reason.into(),
        }
    }

    /// Create an other error
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }

    /// Whether an operator has to be alerted
    ///
    /// Both the primary path and its safety net failed, or the safety net is
    /// out of space.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PartialDegradation { .. } | Self::LocalOverflowFull { .. }
        )
    }
}

impl From<serde_json::Error> for ResilienceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ResilienceError::invalid_config("capacity");
        assert_eq!(err.to_string(), "Invalid configuration: capacity");

        let err = ResilienceError::partial_degradation("ledger-write", "disk gone");
        assert_eq!(
            err.to_string(),
            "Partial degradation on 'ledger-write': disk gone"
        );

        let err = ResilienceError::LocalOverflowFull {
            path: PathBuf::from("/var/spill"),
            used: 1000,
            limit: 512,
        };
        assert_eq!(
            err.to_string(),
            "Local overflow full at /var/spill: 1000 of 512 bytes used"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ResilienceError::partial_degradation("a", "b").is_fatal());
        assert!(ResilienceError::LocalOverflowFull {
            path: PathBuf::new(),
            used: 0,
            limit: 0,
        }
        .is_fatal());
        assert!(!ResilienceError::queue_inspection("ingest", "depth read failed").is_fatal());
        assert!(!ResilienceError::invalid_config("x").is_fatal());
    }
}
