//! Error types for the bundle engine
//!
//! `EngineError` is what the public control surface returns. Task execution
//! has its own taxonomy (`TaskError`) because a task failure never aborts a
//! bundle; it only decides between retry and terminal failure.

use crate::types::{BundleId, BundleStatus, TaskId};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors surfaced by the orchestrator and scheduler
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Bad request shape or missing required field
    #[error("Validation error: {0}")]
    Validation(String),

    /// Ledger unreachable, no eligible accounts and similar
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Bundle not found: {0}")]
    NotFound(BundleId),

    #[error("Cannot {action} bundle {bundle_id} in state {status}")]
    InvalidState {
        bundle_id: BundleId,
        status: BundleStatus,
        action: &'static str,
    },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Task queue backend errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    /// Backend unreachable or connection dropped
    #[error("Queue connection error ({backend}): {message}")]
    Connection { backend: String, message: String },

    #[error("Queue operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Queue serialization error: {0}")]
    Serialization(String),

    #[error("Job not found: {0}")]
    JobNotFound(TaskId),

    #[error("Queue closed")]
    Closed,
}

impl QueueError {
    /// Errors that count towards the failover threshold
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, QueueError::Connection { .. } | QueueError::Timeout(_))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis-queue")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            QueueError::Timeout(0)
        } else {
            QueueError::Connection {
                backend: "redis".to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// Persistence collaborator errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PersistenceError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Ledger client errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    #[error("RPC error: {message} (endpoint: {endpoint})")]
    Rpc { endpoint: String, message: String },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// The ledger refused the transaction
    #[error("Transaction rejected: {0}")]
    Rejected(String),
}

/// Outcome classification of a failed submission attempt
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    /// Known-transient failure, requeued with backoff
    #[error("Retryable: {0}")]
    Retryable(String),

    /// Terminal on first occurrence
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Call short-circuited by an open breaker
    #[error("Circuit breaker open for {endpoint}")]
    CircuitOpen { endpoint: String },

    /// Bundle cancelled while the task was waiting
    #[error("Cancelled")]
    Cancelled,
}

static TRANSIENT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)(network|timed? ?out|timeout|connection|connect|nonce|sequence|fee|underpriced",
        r"|insufficient funds|rate limit|unavailable)",
    ))
    .expect("transient error pattern is valid")
});

impl TaskError {
    /// Classify a raw ledger error message
    pub fn classify(message: &str) -> Self {
        if TRANSIENT_PATTERN.is_match(message) {
            TaskError::Retryable(message.to_string())
        } else {
            TaskError::Fatal(message.to_string())
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Retryable(_) | TaskError::CircuitOpen { .. })
    }

    /// Sequence-number mismatch reported by the ledger
    pub fn is_sequence_mismatch(&self) -> bool {
        match self {
            TaskError::Retryable(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("nonce") || msg.contains("sequence")
            }
            _ => false,
        }
    }
}

impl From<LedgerError> for TaskError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Timeout(_) => TaskError::Retryable(err.to_string()),
            LedgerError::Rpc { .. } => TaskError::Retryable(err.to_string()),
            LedgerError::Rejected(msg) => TaskError::classify(&msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_keywords_are_retryable() {
        for msg in [
            "network unreachable",
            "request timed out",
            "Connection reset by peer",
            "nonce too low",
            "replacement transaction underpriced",
            "max fee per gas less than block base fee",
            "insufficient funds for gas * price + value",
        ] {
            assert!(TaskError::classify(msg).is_retryable(), "{msg}");
        }
    }

    #[test]
    fn test_unknown_errors_are_fatal() {
        let err = TaskError::classify("execution reverted: transfer amount exceeds allowance");
        assert!(matches!(err, TaskError::Fatal(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_circuit_open_is_retryable() {
        let err = TaskError::CircuitOpen {
            endpoint: "primary".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Circuit breaker open for primary");
    }

    #[test]
    fn test_ledger_error_conversion() {
        let rpc: TaskError = LedgerError::Rpc {
            endpoint: "primary".to_string(),
            message: "502 bad gateway".to_string(),
        }
        .into();
        assert!(rpc.is_retryable());

        let rejected: TaskError = LedgerError::Rejected("invalid signature".to_string()).into();
        assert!(matches!(rejected, TaskError::Fatal(_)));

        let nonce: TaskError = LedgerError::Rejected("nonce too low".to_string()).into();
        assert!(nonce.is_sequence_mismatch());
    }

    #[test]
    fn test_queue_backend_failure_classification() {
        assert!(QueueError::Timeout(500).is_backend_failure());
        assert!(QueueError::Connection {
            backend: "redis".to_string(),
            message: "refused".to_string()
        }
        .is_backend_failure());
        assert!(!QueueError::Serialization("bad".to_string()).is_backend_failure());
    }
}
