//! Bundle orchestrator
//!
//! Public entry point of the engine. `launch` validates a request, probes
//! the ledger, resolves and filters accounts, plans and hands the plan to
//! the scheduler. Progress, history and event subscription are answered
//! from persistence and the event bus.

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::metrics::metrics;
use crate::observability::TraceContext;
use crate::planner::{FeePolicy, MarketConditions, PlanContext, Planner, TimingPolicy};
use crate::ports::{LedgerClient, NotificationSink, Persistence};
use crate::queue::{select_backend, FailoverQueue, TaskQueue};
use crate::scheduler::{BundleScheduler, SchedulerDeps};
use crate::types::{
    Account, Bundle, BundleId, ProcessorKind, Progress, TaskStatus, TransactionKind,
    TransactionTemplate,
};
use chrono::Utc;
use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Parameters of a bundle launch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub name: String,
    pub template: TransactionTemplate,
    /// Explicit accounts; all idle accounts when absent
    #[serde(default)]
    pub account_ids: Option<Vec<String>>,
    #[serde(default)]
    pub processor: Option<ProcessorKind>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Per-bundle override of the configured timing policy
    #[serde(default)]
    pub timing: Option<TimingPolicy>,
    /// Per-bundle override of the configured fee policy
    #[serde(default)]
    pub fees: Option<FeePolicy>,
}

fn require_target(field: &str, value: &Option<String>) -> EngineResult<()> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(()),
        _ => Err(EngineError::Validation(format!("{field} is required"))),
    }
}

fn require_amount(amount: u64) -> EngineResult<()> {
    if amount == 0 {
        return Err(EngineError::Validation(
            "amount must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

impl LaunchRequest {
    pub fn new(name: impl Into<String>, template: TransactionTemplate) -> Self {
        Self {
            name: name.into(),
            template,
            account_ids: None,
            processor: None,
            max_attempts: None,
            timing: None,
            fees: None,
        }
    }

    pub fn with_accounts(mut self, ids: Vec<String>) -> Self {
        self.account_ids = Some(ids);
        self
    }

    pub fn with_processor(mut self, processor: ProcessorKind) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Shape checks done before any I/O
    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("bundle name is required".to_string()));
        }

        match &self.template.kind {
            TransactionKind::Transfer { recipient, amount } => {
                require_target("recipient", recipient)?;
                require_amount(*amount)?;
            }
            TransactionKind::AddLiquidity { target, amount }
            | TransactionKind::RemoveLiquidity { target, amount } => {
                require_target("target", target)?;
                require_amount(*amount)?;
            }
            TransactionKind::ContractCall { target, .. } => {
                require_target("target", target)?;
            }
        }

        if self.max_attempts == Some(0) {
            return Err(EngineError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if matches!(&self.account_ids, Some(ids) if ids.is_empty()) {
            return Err(EngineError::Validation("account list is empty".to_string()));
        }

        let as_validation = |e: EngineError| match e {
            EngineError::Config(msg) => EngineError::Validation(msg),
            other => other,
        };
        if let Some(timing) = &self.timing {
            timing.validate().map_err(as_validation)?;
        }
        if let Some(fees) = &self.fees {
            fees.validate().map_err(as_validation)?;
        }
        Ok(())
    }
}

/// Remaining time once at least 10% is done: `elapsed / p * (1 - p)`
pub fn estimate_remaining_ms(elapsed_ms: u64, fraction_done: f64) -> Option<u64> {
    if !fraction_done.is_finite() || fraction_done < 0.1 {
        return None;
    }
    if fraction_done >= 1.0 {
        return Some(0);
    }
    Some((elapsed_ms as f64 / fraction_done * (1.0 - fraction_done)).round() as u64)
}

/// Top-level engine handle
pub struct BundleOrchestrator {
    config: EngineConfig,
    persistence: Arc<dyn Persistence>,
    ledger: Arc<dyn LedgerClient>,
    scheduler: Arc<BundleScheduler>,
    events: EventBus,
    planner: Planner,
    rng: Mutex<StdRng>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl BundleOrchestrator {
    /// Select the queue backend from configuration and start the engine
    pub async fn start(
        config: EngineConfig,
        persistence: Arc<dyn Persistence>,
        ledger: Arc<dyn LedgerClient>,
        notifier: Arc<dyn NotificationSink>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let queue = select_backend(&config.queue).await;
        Self::with_queue(config, queue, persistence, ledger, notifier)
    }

    /// Start the engine on a caller-supplied initial backend. The backend is
    /// wrapped in a `FailoverQueue`.
    pub fn with_queue(
        config: EngineConfig,
        queue: Arc<dyn TaskQueue>,
        persistence: Arc<dyn Persistence>,
        ledger: Arc<dyn LedgerClient>,
        notifier: Arc<dyn NotificationSink>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let planner = Planner::new(config.timing.clone(), config.fees.clone())?;
        let events = EventBus::new(config.monitoring.event_capacity);
        let queue: Arc<dyn TaskQueue> = Arc::new(FailoverQueue::new(queue, &config.queue));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));

        let scheduler = Arc::new(BundleScheduler::new(
            SchedulerDeps {
                queue,
                persistence: persistence.clone(),
                ledger: ledger.clone(),
                breakers,
                events: events.clone(),
            },
            config.scheduler.clone(),
            config.retry.clone(),
        ));
        scheduler.start();

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let forwarder = spawn_event_forwarder(&events, persistence.clone(), notifier);

        info!(
            endpoint = ledger.endpoint(),
            backend = ?scheduler.queue().backend(),
            "Bundle orchestrator started"
        );
        Ok(Self {
            config,
            persistence,
            ledger,
            scheduler,
            events,
            planner,
            rng: Mutex::new(rng),
            background: Mutex::new(vec![forwarder]),
        })
    }

    pub fn scheduler(&self) -> &Arc<BundleScheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate, plan and schedule a bundle
    pub async fn launch(&self, request: LaunchRequest) -> EngineResult<BundleId> {
        let trace = TraceContext::new("launch");
        let span = trace.span();
        self.launch_inner(request).instrument(span).await
    }

    async fn launch_inner(&self, request: LaunchRequest) -> EngineResult<BundleId> {
        request.validate()?;

        let market = self.probe_ledger().await?;
        let accounts = self.resolve_accounts(&request).await?;

        let planner = if request.timing.is_none() && request.fees.is_none() {
            self.planner.clone()
        } else {
            Planner::new(
                request.timing.clone().unwrap_or_else(|| self.config.timing.clone()),
                request.fees.clone().unwrap_or_else(|| self.config.fees.clone()),
            )?
        };

        let bundle = Bundle::new(request.name.clone(), accounts.len());
        self.persistence.create_bundle(&bundle).await?;

        let plan = {
            let mut rng = self.rng.lock();
            planner.plan(
                &PlanContext {
                    bundle_id: bundle.id,
                    accounts: &accounts,
                    template: &request.template,
                    processor: request
                        .processor
                        .unwrap_or(self.config.scheduler.default_processor),
                    max_attempts: request.max_attempts.unwrap_or(self.config.retry.max_attempts),
                    market,
                },
                &mut *rng,
            )
        };

        let id = bundle.id;
        info!(
            bundle_id = %id,
            name = %request.name,
            kind = request.template.kind.label(),
            accounts = accounts.len(),
            windows = plan.total_windows,
            "Launching bundle"
        );
        self.scheduler
            .schedule(bundle, plan, planner.fees().min_fee)
            .await?;
        metrics().bundles_launched.inc();
        self.spawn_analytics_refresh(id);
        Ok(id)
    }

    /// Health probe; its fee rate feeds the fee planner
    async fn probe_ledger(&self) -> EngineResult<MarketConditions> {
        let timeout = Duration::from_millis(self.config.ledger.health_check_timeout_ms);
        let endpoint = self.ledger.endpoint().to_string();
        let health = match tokio::time::timeout(timeout, self.ledger.health_check()).await {
            Ok(Ok(health)) => health,
            Ok(Err(e)) => {
                return Err(EngineError::Precondition(format!(
                    "ledger endpoint {endpoint} unreachable: {e}"
                )))
            }
            Err(_) => {
                return Err(EngineError::Precondition(format!(
                    "ledger endpoint {endpoint} health check timed out"
                )))
            }
        };
        if !health.healthy {
            return Err(EngineError::Precondition(format!(
                "ledger endpoint {endpoint} is unhealthy"
            )));
        }
        debug!(latency_ms = health.latency_ms, fee_rate = health.fee_rate, "Ledger healthy");
        Ok(MarketConditions {
            fee_rate: health.fee_rate,
        })
    }

    /// Explicit or idle accounts, minus unusable and underfunded ones
    async fn resolve_accounts(&self, request: &LaunchRequest) -> EngineResult<Vec<Account>> {
        let candidates = match &request.account_ids {
            Some(ids) => {
                let found = self.persistence.get_accounts(ids).await?;
                if found.len() < ids.len() {
                    warn!(
                        requested = ids.len(),
                        found = found.len(),
                        "Some requested accounts do not exist"
                    );
                }
                found
            }
            None => self.persistence.list_idle_accounts().await?,
        };

        let balances = futures::future::join_all(
            candidates.iter().map(|account| self.ledger.get_balance(account)),
        )
        .await;

        let min_balance = self.config.accounts.min_account_balance;
        let eligible: Vec<Account> = candidates
            .into_iter()
            .zip(balances)
            .filter_map(|(mut account, balance)| {
                match balance {
                    Ok(balance) => account.balance = balance,
                    Err(e) => {
                        warn!(
                            account = %account.id,
                            error = %e,
                            "Balance refresh failed, using cached balance"
                        )
                    }
                }
                if !account.health.is_usable() {
                    debug!(
                        account = %account.id,
                        health = ?account.health,
                        "Skipping unhealthy account"
                    );
                    return None;
                }
                if account.balance < min_balance {
                    debug!(
                        account = %account.id,
                        balance = account.balance,
                        min_balance,
                        "Skipping underfunded account"
                    );
                    return None;
                }
                Some(account)
            })
            .collect();

        if eligible.is_empty() {
            return Err(EngineError::Precondition(
                "no eligible accounts: all are unhealthy, underfunded or missing".to_string(),
            ));
        }
        Ok(eligible)
    }

    fn spawn_analytics_refresh(&self, id: BundleId) {
        let scheduler = self.scheduler.clone();
        let period = Duration::from_millis(self.config.monitoring.analytics_refresh_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match scheduler.refresh_analytics(id).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!(bundle_id = %id, error = %e, "Analytics refresh failed"),
                }
            }
            debug!(bundle_id = %id, "Analytics refresh stopped");
        });

        let mut background = self.background.lock();
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    pub async fn pause(&self, id: BundleId) -> EngineResult<Bundle> {
        self.scheduler.pause(id).await
    }

    pub async fn resume(&self, id: BundleId) -> EngineResult<Bundle> {
        self.scheduler.resume(id).await
    }

    pub async fn cancel(&self, id: BundleId) -> EngineResult<Bundle> {
        self.scheduler.cancel(id).await
    }

    /// Live counts, elapsed time and, past 10%, an ETA
    pub async fn get_progress(&self, id: BundleId) -> EngineResult<Option<Progress>> {
        let Some(mut bundle) = self.persistence.get_bundle(id).await? else {
            return Ok(None);
        };
        let tasks = self.persistence.list_tasks_by_bundle(id).await?;
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        bundle.set_counts(count(TaskStatus::Completed), count(TaskStatus::Failed));

        let elapsed_ms = bundle
            .started_at
            .map(|start| {
                let end = bundle.completed_at.unwrap_or_else(Utc::now);
                (end - start).num_milliseconds().max(0) as u64
            })
            .unwrap_or(0);
        let estimated_remaining_ms = if bundle.status.is_terminal() {
            Some(0)
        } else {
            estimate_remaining_ms(elapsed_ms, bundle.progress_percentage / 100.0)
        };

        Ok(Some(Progress {
            bundle_id: id,
            status: bundle.status,
            total: bundle.total,
            completed: bundle.completed,
            failed: bundle.failed,
            waiting: count(TaskStatus::Waiting),
            active: count(TaskStatus::Active),
            progress_percentage: bundle.progress_percentage,
            elapsed_ms,
            estimated_remaining_ms,
        }))
    }

    /// Most recent bundles first
    pub async fn get_history(&self, limit: Option<usize>) -> EngineResult<Vec<Bundle>> {
        let limit = limit.unwrap_or(self.config.monitoring.history_limit);
        Ok(self.persistence.list_bundles(limit).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Stop workers and background loops
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for BundleOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Record every event and hand it to the notification sink
fn spawn_event_forwarder(
    events: &EventBus,
    persistence: Arc<dyn Persistence>,
    notifier: Arc<dyn NotificationSink>,
) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = persistence.record_event(&event).await {
                        warn!(topic = event.topic(), error = %e, "Failed to record event");
                    }
                    notifier.notify(&event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::transfer_template;

    #[test]
    fn test_transfer_requires_recipient_and_amount() {
        let mut template = transfer_template();
        template.kind = TransactionKind::Transfer {
            recipient: None,
            amount: 10,
        };
        let err = LaunchRequest::new("b", template.clone()).validate().unwrap_err();
        assert_eq!(err, EngineError::Validation("recipient is required".to_string()));

        template.kind = TransactionKind::Transfer {
            recipient: Some("0xabc".to_string()),
            amount: 0,
        };
        assert!(matches!(
            LaunchRequest::new("b", template).validate(),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_liquidity_requires_target() {
        let template = TransactionTemplate {
            kind: TransactionKind::AddLiquidity {
                target: Some("  ".to_string()),
                amount: 5,
            },
            base_fee: 1_000,
            gas_limit: None,
        };
        assert_eq!(
            LaunchRequest::new("b", template).validate().unwrap_err(),
            EngineError::Validation("target is required".to_string())
        );
    }

    #[test]
    fn test_policy_override_errors_are_validation() {
        let mut request = LaunchRequest::new("b", transfer_template());
        request.timing = Some(TimingPolicy {
            wallets_per_window: 0,
            ..Default::default()
        });
        assert!(matches!(request.validate(), Err(EngineError::Validation(_))));

        let request = LaunchRequest::new("b", transfer_template()).with_max_attempts(0);
        assert!(matches!(request.validate(), Err(EngineError::Validation(_))));

        let request = LaunchRequest::new("b", transfer_template()).with_accounts(vec![]);
        assert!(matches!(request.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_estimate_remaining() {
        assert_eq!(estimate_remaining_ms(1_000, 0.05), None);
        assert_eq!(estimate_remaining_ms(1_000, 0.5), Some(1_000));
        assert_eq!(estimate_remaining_ms(3_000, 0.25), Some(9_000));
        assert_eq!(estimate_remaining_ms(3_000, 1.0), Some(0));
    }
}
