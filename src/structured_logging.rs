//! Structured logging for bundle execution

use crate::observability::CorrelationId;
use crate::types::{BundleId, BundleStatus, TaskId};

/// Structured logger for one bundle's lifecycle
#[derive(Debug, Clone)]
pub struct BundleLogger {
    bundle_id: BundleId,
    correlation_id: CorrelationId,
}

impl BundleLogger {
    pub fn new(bundle_id: BundleId, correlation_id: CorrelationId) -> Self {
        Self {
            bundle_id,
            correlation_id,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn log_launch(&self, accounts: usize, windows: usize, estimated_duration_ms: u64) {
        tracing::info!(
            bundle_id = %self.bundle_id,
            correlation_id = %self.correlation_id,
            accounts,
            windows,
            estimated_duration_ms,
            "Bundle launched"
        );
    }

    pub fn log_task_submitted(&self, task_id: TaskId, account: &str, sequence: u64, fee: u64) {
        tracing::debug!(
            bundle_id = %self.bundle_id,
            correlation_id = %self.correlation_id,
            task_id = %task_id,
            account = %account,
            sequence,
            fee,
            "Submitting task"
        );
    }

    pub fn log_task_success(&self, task_id: TaskId, hash: &str, latency_ms: u64) {
        tracing::info!(
            bundle_id = %self.bundle_id,
            correlation_id = %self.correlation_id,
            task_id = %task_id,
            tx_hash = %hash,
            latency_ms,
            "Task completed"
        );
    }

    pub fn log_task_failure(&self, task_id: TaskId, error: &str, attempt: u32, will_retry: bool) {
        tracing::warn!(
            bundle_id = %self.bundle_id,
            correlation_id = %self.correlation_id,
            task_id = %task_id,
            error = %error,
            attempt,
            will_retry,
            "Task attempt failed"
        );
    }

    pub fn log_status(&self, from: BundleStatus, to: BundleStatus) {
        tracing::info!(
            bundle_id = %self.bundle_id,
            correlation_id = %self.correlation_id,
            from = %from,
            to = %to,
            "Bundle status changed"
        );
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(
            bundle_id = %self.bundle_id,
            correlation_id = %self.correlation_id,
            message = %message,
            "Warning"
        );
    }
}
