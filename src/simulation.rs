//! In-memory collaborators for simulation mode and tests
//!
//! `InMemoryPersistence` stores everything in process maps, `SimulatedLedger`
//! answers like a ledger endpoint with scriptable failures, and
//! `LogNotificationSink` writes events to the log.

use crate::errors::{LedgerError, PersistenceError};
use crate::events::EngineEvent;
use crate::ports::{
    ActivityLog, LedgerClient, LedgerHealth, NotificationSink, Persistence, PersistenceResult,
    SubmitParams, SubmitReceipt,
};
use crate::types::{Account, Bundle, BundleId, BundleTask, TaskId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Store {
    bundles: HashMap<BundleId, Bundle>,
    /// Insertion order of bundles, oldest first
    bundle_order: Vec<BundleId>,
    tasks: HashMap<BundleId, Vec<BundleTask>>,
    accounts: Vec<Account>,
    events: Vec<EngineEvent>,
    activity: Vec<ActivityLog>,
}

/// Process-local `Persistence`
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    store: RwLock<Store>,
    /// Task inserts left before `create_task` starts failing
    task_create_budget: Mutex<Option<usize>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: Vec<Account>) -> Self {
        let persistence = Self::new();
        persistence.store.write().accounts = accounts;
        persistence
    }

    pub fn upsert_account(&self, account: Account) {
        let mut store = self.store.write();
        match store.accounts.iter_mut().find(|a| a.id == account.id) {
            Some(existing) => *existing = account,
            None => store.accounts.push(account),
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.store.read().events.clone()
    }

    pub fn activity_logs(&self) -> Vec<ActivityLog> {
        self.store.read().activity.clone()
    }

    /// Let the next `successes` task inserts through, then fail every one
    pub fn fail_task_creates_after(&self, successes: usize) {
        *self.task_create_budget.lock() = Some(successes);
    }

    pub fn task(&self, bundle_id: BundleId, task_id: TaskId) -> Option<BundleTask> {
        self.store
            .read()
            .tasks
            .get(&bundle_id)?
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn create_bundle(&self, bundle: &Bundle) -> PersistenceResult<()> {
        let mut store = self.store.write();
        if store.bundles.insert(bundle.id, bundle.clone()).is_none() {
            store.bundle_order.push(bundle.id);
        }
        Ok(())
    }

    async fn update_bundle(&self, bundle: &Bundle) -> PersistenceResult<()> {
        let mut store = self.store.write();
        match store.bundles.get_mut(&bundle.id) {
            Some(existing) => {
                *existing = bundle.clone();
                Ok(())
            }
            None => Err(PersistenceError::NotFound(format!("bundle {}", bundle.id))),
        }
    }

    async fn get_bundle(&self, id: BundleId) -> PersistenceResult<Option<Bundle>> {
        Ok(self.store.read().bundles.get(&id).cloned())
    }

    async fn list_bundles(&self, limit: usize) -> PersistenceResult<Vec<Bundle>> {
        let store = self.store.read();
        Ok(store
            .bundle_order
            .iter()
            .rev()
            .filter_map(|id| store.bundles.get(id).cloned())
            .take(limit)
            .collect())
    }

    async fn create_task(&self, task: &BundleTask) -> PersistenceResult<()> {
        if let Some(budget) = self.task_create_budget.lock().as_mut() {
            if *budget == 0 {
                return Err(PersistenceError::Storage("task table unavailable".to_string()));
            }
            *budget -= 1;
        }
        self.store
            .write()
            .tasks
            .entry(task.bundle_id)
            .or_default()
            .push(task.clone());
        Ok(())
    }

    async fn update_task_status(&self, task: &BundleTask) -> PersistenceResult<()> {
        let mut store = self.store.write();
        let existing = store
            .tasks
            .get_mut(&task.bundle_id)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.id == task.id))
            .ok_or_else(|| PersistenceError::NotFound(format!("task {}", task.id)))?;
        *existing = task.clone();
        Ok(())
    }

    async fn list_tasks_by_bundle(&self, id: BundleId) -> PersistenceResult<Vec<BundleTask>> {
        Ok(self.store.read().tasks.get(&id).cloned().unwrap_or_default())
    }

    async fn get_accounts(&self, ids: &[String]) -> PersistenceResult<Vec<Account>> {
        let store = self.store.read();
        Ok(ids
            .iter()
            .filter_map(|id| store.accounts.iter().find(|a| &a.id == id).cloned())
            .collect())
    }

    async fn list_idle_accounts(&self) -> PersistenceResult<Vec<Account>> {
        Ok(self
            .store
            .read()
            .accounts
            .iter()
            .filter(|a| a.idle)
            .cloned()
            .collect())
    }

    async fn record_event(&self, event: &EngineEvent) -> PersistenceResult<()> {
        self.store.write().events.push(event.clone());
        Ok(())
    }

    async fn create_activity_log(&self, entry: &ActivityLog) -> PersistenceResult<()> {
        self.store.write().activity.push(entry.clone());
        Ok(())
    }
}

/// Ledger stand-in with configurable latency, health and failures.
///
/// Failures are served first from the per-address script, then from the
/// global script, then drawn at `failure_rate`.
pub struct SimulatedLedger {
    endpoint: String,
    healthy: AtomicBool,
    fee_rate: Mutex<f64>,
    latency: Mutex<Duration>,
    failure_rate: Mutex<f64>,
    rng: Mutex<StdRng>,
    pending: DashMap<String, u64>,
    scripted: Mutex<VecDeque<LedgerError>>,
    scripted_by_address: DashMap<String, VecDeque<LedgerError>>,
    submissions: Mutex<Vec<SubmitParams>>,
    sequence_queries: AtomicUsize,
    hash_counter: AtomicU64,
}

impl SimulatedLedger {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            healthy: AtomicBool::new(true),
            fee_rate: Mutex::new(10.0),
            latency: Mutex::new(Duration::ZERO),
            failure_rate: Mutex::new(0.0),
            rng: Mutex::new(StdRng::from_entropy()),
            pending: DashMap::new(),
            scripted: Mutex::new(VecDeque::new()),
            scripted_by_address: DashMap::new(),
            submissions: Mutex::new(Vec::new()),
            sequence_queries: AtomicUsize::new(0),
            hash_counter: AtomicU64::new(0),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Random transient failures at `rate` (0.0..=1.0)
    pub fn with_failure_rate(self, rate: f64, seed: Option<u64>) -> Self {
        *self.failure_rate.lock() = rate.clamp(0.0, 1.0);
        if let Some(seed) = seed {
            *self.rng.lock() = StdRng::seed_from_u64(seed);
        }
        self
    }

    pub fn with_fee_rate(self, fee_rate: f64) -> Self {
        self.set_fee_rate(fee_rate);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_fee_rate(&self, fee_rate: f64) {
        *self.fee_rate.lock() = fee_rate;
    }

    pub fn set_pending_sequence(&self, address: &str, sequence: u64) {
        self.pending.insert(address.to_string(), sequence);
    }

    /// Queue a failure for the next submission from any account
    pub fn fail_next(&self, error: LedgerError) {
        self.scripted.lock().push_back(error);
    }

    /// Queue a failure for the next submission from `address`
    pub fn fail_next_for(&self, address: &str, error: LedgerError) {
        self.scripted_by_address
            .entry(address.to_string())
            .or_default()
            .push_back(error);
    }

    /// Every submission that reached the ledger, including failed ones
    pub fn submissions(&self) -> Vec<SubmitParams> {
        self.submissions.lock().clone()
    }

    pub fn sequence_queries(&self) -> usize {
        self.sequence_queries.load(Ordering::SeqCst)
    }

    fn next_failure(&self, address: &str) -> Option<LedgerError> {
        if let Some(err) = self
            .scripted_by_address
            .get_mut(address)
            .and_then(|mut queue| queue.pop_front())
        {
            return Some(err);
        }
        if let Some(err) = self.scripted.lock().pop_front() {
            return Some(err);
        }
        let rate = *self.failure_rate.lock();
        if rate > 0.0 && self.rng.lock().gen_bool(rate) {
            return Some(LedgerError::Rpc {
                endpoint: self.endpoint.clone(),
                message: "network error: connection reset".to_string(),
            });
        }
        None
    }
}

impl std::fmt::Debug for SimulatedLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedLedger")
            .field("endpoint", &self.endpoint)
            .field("healthy", &self.healthy.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn health_check(&self) -> Result<LedgerHealth, LedgerError> {
        let latency = *self.latency.lock();
        Ok(LedgerHealth {
            healthy: self.healthy.load(Ordering::SeqCst),
            latency_ms: latency.as_millis() as u64,
            fee_rate: *self.fee_rate.lock(),
        })
    }

    async fn get_balance(&self, account: &Account) -> Result<u64, LedgerError> {
        Ok(account.balance)
    }

    async fn allocate_sequence(&self, account: &Account) -> Result<u64, LedgerError> {
        self.sequence_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .pending
            .get(&account.address)
            .map(|s| *s)
            .or(account.sequence)
            .unwrap_or(0))
    }

    async fn submit(&self, params: SubmitParams) -> Result<SubmitReceipt, LedgerError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.submissions.lock().push(params.clone());

        if let Some(err) = self.next_failure(&params.account.address) {
            debug!(task_id = %params.task_id, error = %err, "Simulated submission failed");
            return Err(err);
        }

        let address = params.account.address.clone();
        let pending = self
            .pending
            .get(&address)
            .map(|s| *s)
            .or(params.account.sequence)
            .unwrap_or(0);
        if params.sequence < pending {
            return Err(LedgerError::Rejected(format!(
                "nonce too low: next nonce {pending}, tx nonce {}",
                params.sequence
            )));
        }
        // No queueing of future nonces: a gap is refused outright
        if params.sequence > pending {
            return Err(LedgerError::Rejected(format!(
                "nonce too high: next nonce {pending}, tx nonce {}",
                params.sequence
            )));
        }
        self.pending.insert(address, params.sequence + 1);

        let n = self.hash_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SubmitReceipt {
            hash: format!("0x{n:064x}"),
            fee_paid: Some(params.fee),
        })
    }
}

/// Writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn notify(&self, event: &EngineEvent) {
        match event {
            EngineEvent::BundleProgress {
                bundle_id,
                progress_percentage,
                ..
            } => {
                info!(
                    bundle_id = %bundle_id,
                    progress = format!("{progress_percentage:.1}%"),
                    "Bundle progress"
                );
            }
            EngineEvent::BundleCompleted {
                bundle_id,
                status,
                completed,
                failed,
                total,
                ..
            } => {
                info!(
                    bundle_id = %bundle_id,
                    status = %status,
                    completed,
                    failed,
                    total,
                    "Bundle finished"
                );
            }
            other => {
                debug!(bundle_id = %other.bundle_id(), topic = other.topic(), "Engine event");
            }
        }
    }
}

/// Keeps every event it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, event: &EngineEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TaskError;
    use crate::types::{TransactionKind, TransactionTemplate};

    fn params(account: &Account, sequence: u64) -> SubmitParams {
        SubmitParams {
            task_id: TaskId::new(),
            account: account.clone(),
            template: TransactionTemplate {
                kind: TransactionKind::Transfer {
                    recipient: Some("0xdead".to_string()),
                    amount: 1,
                },
                base_fee: 1_000,
                gas_limit: None,
            },
            sequence,
            fee: 1_200,
            private_submission: false,
        }
    }

    #[tokio::test]
    async fn test_scripted_failures_served_in_order() {
        let ledger = SimulatedLedger::new("sim");
        let account = Account::new("a", "0xa", 1_000_000);
        ledger.fail_next(LedgerError::Timeout(500));
        ledger.fail_next_for("0xa", LedgerError::Rejected("nonce too low".to_string()));

        let first = ledger.submit(params(&account, 0)).await.unwrap_err();
        assert!(matches!(first, LedgerError::Rejected(_)));
        let second = ledger.submit(params(&account, 0)).await.unwrap_err();
        assert_eq!(second, LedgerError::Timeout(500));
        let receipt = ledger.submit(params(&account, 0)).await.unwrap();
        assert_eq!(receipt.fee_paid, Some(1_200));
        assert_eq!(ledger.submissions().len(), 3);
    }

    #[tokio::test]
    async fn test_stale_sequence_rejected() {
        let ledger = SimulatedLedger::new("sim");
        let account = Account::new("a", "0xa", 1_000_000);
        ledger.set_pending_sequence("0xa", 4);
        ledger.submit(params(&account, 4)).await.unwrap();

        let err = ledger.submit(params(&account, 4)).await.unwrap_err();
        assert!(err.to_string().contains("nonce too low"));
        assert_eq!(ledger.allocate_sequence(&account).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_sequence_gap_rejected() {
        let ledger = SimulatedLedger::new("sim");
        let account = Account::new("a", "0xa", 1_000_000);
        ledger.submit(params(&account, 0)).await.unwrap();

        let err = ledger.submit(params(&account, 2)).await.unwrap_err();
        assert!(err.to_string().contains("nonce too high"));
        assert!(TaskError::from(err).is_sequence_mismatch());
        assert_eq!(ledger.allocate_sequence(&account).await.unwrap(), 1);
        ledger.submit(params(&account, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_bundles_newest_first() {
        let persistence = InMemoryPersistence::new();
        let older = Bundle::new("older", 1);
        let newer = Bundle::new("newer", 1);
        persistence.create_bundle(&older).await.unwrap();
        persistence.create_bundle(&newer).await.unwrap();

        let listed = persistence.list_bundles(10).await.unwrap();
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(persistence.list_bundles(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_idle_accounts_only() {
        let mut busy = Account::new("busy", "0xb", 10);
        busy.idle = false;
        let persistence =
            InMemoryPersistence::with_accounts(vec![Account::new("idle", "0xi", 10), busy]);
        let idle = persistence.list_idle_accounts().await.unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, "idle");
    }
}
