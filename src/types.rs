//! Common types used throughout the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleId(pub Uuid);

impl BundleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BundleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a single planned submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health classification of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountHealth {
    Good,
    Degraded,
    Critical,
    Offline,
}

impl AccountHealth {
    /// Whether an account in this state may be scheduled
    pub fn is_usable(self) -> bool {
        matches!(self, AccountHealth::Good | AccountHealth::Degraded)
    }
}

/// An entity able to submit ledger transactions.
///
/// Owned by the calling application; the engine only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub address: String,
    /// Last sequence number the application saw for this account
    #[serde(default)]
    pub sequence: Option<u64>,
    pub health: AccountHealth,
    /// Funding balance in base units
    pub balance: u64,
    /// Not currently assigned to another bundle
    #[serde(default = "default_idle")]
    pub idle: bool,
}

fn default_idle() -> bool {
    true
}

impl Account {
    pub fn new(id: impl Into<String>, address: impl Into<String>, balance: u64) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            sequence: None,
            health: AccountHealth::Good,
            balance,
            idle: true,
        }
    }

    pub fn with_health(mut self, health: AccountHealth) -> Self {
        self.health = health;
        self
    }
}

/// What a task submits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionKind {
    Transfer {
        recipient: Option<String>,
        amount: u64,
    },
    AddLiquidity {
        target: Option<String>,
        amount: u64,
    },
    RemoveLiquidity {
        target: Option<String>,
        amount: u64,
    },
    ContractCall {
        target: Option<String>,
        #[serde(default)]
        data: Vec<u8>,
        #[serde(default)]
        value: u64,
    },
}

impl TransactionKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransactionKind::Transfer { .. } => "transfer",
            TransactionKind::AddLiquidity { .. } => "add_liquidity",
            TransactionKind::RemoveLiquidity { .. } => "remove_liquidity",
            TransactionKind::ContractCall { .. } => "contract_call",
        }
    }
}

/// Transaction template shared by every task of a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionTemplate {
    pub kind: TransactionKind,
    /// Base fee in fee units before any multiplier
    pub base_fee: u64,
    #[serde(default)]
    pub gas_limit: Option<u64>,
}

/// Which worker pool runs a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    Parallel,
    Sequential,
}

impl ProcessorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorKind::Parallel => "parallel",
            ProcessorKind::Sequential => "sequential",
        }
    }
}

/// Task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// One planned account -> transaction submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleTask {
    pub id: TaskId,
    pub bundle_id: BundleId,
    pub account: Account,
    pub template: TransactionTemplate,
    pub delay_ms: u64,
    pub fee_multiplier: f64,
    pub window_index: usize,
    /// Route through the ledger client's private submission path
    #[serde(default)]
    pub private_submission: bool,
    pub processor: ProcessorKind,
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub tx_hash: Option<String>,
    pub fee_paid: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Bundle lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    Pending,
    Executing,
    Paused,
    Completed,
    Failed,
}

impl BundleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BundleStatus::Completed | BundleStatus::Failed)
    }
}

impl fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BundleStatus::Pending => "pending",
            BundleStatus::Executing => "executing",
            BundleStatus::Paused => "paused",
            BundleStatus::Completed => "completed",
            BundleStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Fee and success figures refreshed while a bundle runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleAnalytics {
    pub total_fees_paid: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
}

impl BundleAnalytics {
    /// Aggregate over the terminal tasks of a bundle
    pub fn from_tasks(tasks: &[BundleTask]) -> Self {
        let completed: Vec<&BundleTask> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .collect();
        let failed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();

        let finished = completed.len() + failed;
        let success_rate = if finished == 0 {
            0.0
        } else {
            completed.len() as f64 / finished as f64
        };

        let latencies: Vec<i64> = completed
            .iter()
            .filter_map(|t| match (t.started_at, t.finished_at) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
                _ => None,
            })
            .collect();
        let average_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<i64>() as f64 / latencies.len() as f64
        };

        Self {
            total_fees_paid: completed.iter().filter_map(|t| t.fee_paid).sum(),
            success_rate,
            average_latency_ms,
        }
    }
}

/// Aggregate root of a batch of tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub id: BundleId,
    pub name: String,
    pub status: BundleStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub progress_percentage: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub analytics: BundleAnalytics,
}

impl Bundle {
    pub fn new(name: impl Into<String>, total: usize) -> Self {
        Self {
            id: BundleId::new(),
            name: name.into(),
            status: BundleStatus::Pending,
            total,
            completed: 0,
            failed: 0,
            progress_percentage: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failure_reason: None,
            analytics: BundleAnalytics::default(),
        }
    }

    /// Update counters, clamping so `completed + failed` never exceeds `total`
    pub fn set_counts(&mut self, completed: usize, failed: usize) {
        let completed = completed.min(self.total);
        let failed = failed.min(self.total - completed);
        self.completed = completed;
        self.failed = failed;
        self.progress_percentage = progress_percentage(completed + failed, self.total);
    }
}

/// `done / total * 100`, 0 for an empty bundle
pub fn progress_percentage(done: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}

/// Live view of a bundle returned by progress queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub bundle_id: BundleId,
    pub status: BundleStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub waiting: usize,
    pub active: usize,
    pub progress_percentage: f64,
    pub elapsed_ms: u64,
    /// Present once at least 10% of the tasks are done
    pub estimated_remaining_ms: Option<u64>,
}
