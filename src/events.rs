//! Engine event topics and the broadcast bus that carries them

use crate::types::{BundleId, BundleStatus, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Bounded set of topics published by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "camelCase")]
pub enum EngineEvent {
    TaskCompleted {
        bundle_id: BundleId,
        task_id: TaskId,
        account_id: String,
        tx_hash: String,
        attempt: u32,
    },
    TaskFailed {
        bundle_id: BundleId,
        task_id: TaskId,
        account_id: String,
        error: String,
        attempt: u32,
        will_retry: bool,
    },
    BundleProgress {
        bundle_id: BundleId,
        completed: usize,
        failed: usize,
        total: usize,
        progress_percentage: f64,
    },
    BundleCompleted {
        bundle_id: BundleId,
        status: BundleStatus,
        completed: usize,
        failed: usize,
        total: usize,
        failure_reason: Option<String>,
    },
}

impl EngineEvent {
    pub fn bundle_id(&self) -> BundleId {
        match self {
            EngineEvent::TaskCompleted { bundle_id, .. }
            | EngineEvent::TaskFailed { bundle_id, .. }
            | EngineEvent::BundleProgress { bundle_id, .. }
            | EngineEvent::BundleCompleted { bundle_id, .. } => *bundle_id,
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            EngineEvent::TaskCompleted { .. } => "taskCompleted",
            EngineEvent::TaskFailed { .. } => "taskFailed",
            EngineEvent::BundleProgress { .. } => "bundleProgress",
            EngineEvent::BundleCompleted { .. } => "bundleCompleted",
        }
    }
}

/// Multi-consumer event bus. Slow subscribers lag and drop old events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
