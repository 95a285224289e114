//! Collaborator interfaces consumed by the engine
//!
//! Persistence, the ledger client and the notification sink are owned by the
//! embedding application and injected at construction.

use crate::errors::{LedgerError, PersistenceError};
use crate::events::EngineEvent;
use crate::types::{Account, Bundle, BundleId, BundleTask, TaskId, TransactionTemplate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// One line of the per-account activity trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLog {
    pub bundle_id: BundleId,
    pub task_id: TaskId,
    pub account_id: String,
    pub action: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Durable store for bundles, tasks and accounts.
///
/// Single-record CRUD; implementations may be eventually consistent.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn create_bundle(&self, bundle: &Bundle) -> PersistenceResult<()>;
    async fn update_bundle(&self, bundle: &Bundle) -> PersistenceResult<()>;
    async fn get_bundle(&self, id: BundleId) -> PersistenceResult<Option<Bundle>>;
    /// Most recent first
    async fn list_bundles(&self, limit: usize) -> PersistenceResult<Vec<Bundle>>;

    async fn create_task(&self, task: &BundleTask) -> PersistenceResult<()>;
    async fn update_task_status(&self, task: &BundleTask) -> PersistenceResult<()>;
    async fn list_tasks_by_bundle(&self, id: BundleId) -> PersistenceResult<Vec<BundleTask>>;

    async fn get_accounts(&self, ids: &[String]) -> PersistenceResult<Vec<Account>>;
    async fn list_idle_accounts(&self) -> PersistenceResult<Vec<Account>>;

    async fn record_event(&self, event: &EngineEvent) -> PersistenceResult<()>;
    async fn create_activity_log(&self, entry: &ActivityLog) -> PersistenceResult<()>;
}

/// Result of the ledger reachability probe
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedgerHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    /// Prevailing fee rate, used for congestion classification
    pub fee_rate: f64,
}

/// Everything the ledger client needs to build, sign and broadcast one task
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitParams {
    pub task_id: TaskId,
    pub account: Account,
    pub template: TransactionTemplate,
    pub sequence: u64,
    pub fee: u64,
    pub private_submission: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub hash: String,
    /// Fee reported by the receipt, when the ledger returns one
    pub fee_paid: Option<u64>,
}

/// Client of the external ledger endpoint
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Endpoint name, used as the circuit breaker key
    fn endpoint(&self) -> &str;

    async fn health_check(&self) -> Result<LedgerHealth, LedgerError>;
    async fn get_balance(&self, account: &Account) -> Result<u64, LedgerError>;
    /// Pending (next usable) sequence number of the account
    async fn allocate_sequence(&self, account: &Account) -> Result<u64, LedgerError>;
    async fn submit(&self, params: SubmitParams) -> Result<SubmitReceipt, LedgerError>;
}

/// Fire-and-forget progress and completion broadcasts
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &EngineEvent);
}
