//! Bundle scheduler
//!
//! Turns an `ExecutionPlan` into queue jobs and runs them on two processors:
//! a bounded parallel pool and a single spaced sequential worker. A recurring
//! coordination pass recovers stalled jobs and moves bundles to their
//! terminal state. Bundle records are only written under the bundle's lock,
//! by the coordinator or by the pause/resume/cancel surface.

mod coordinator;
mod processor;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::metrics::metrics;
use crate::observability::{CorrelationId, TraceContext};
use crate::planner::ExecutionPlan;
use crate::ports::{LedgerClient, Persistence, PersistenceResult};
use crate::queue::TaskQueue;
use crate::retry::RetryConfig;
use crate::sequence::SequenceAllocator;
use crate::structured_logging::BundleLogger;
use crate::types::{
    Bundle, BundleAnalytics, BundleId, BundleStatus, BundleTask, ProcessorKind, TaskId, TaskStatus,
};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Failure reason recorded on cancelled bundles
pub const CANCELLED_REASON: &str = "cancelled";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker count of the parallel processor
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Processor used when a launch request does not pick one
    #[serde(default = "default_processor")]
    pub default_processor: ProcessorKind,

    /// Sequential spacing per window step
    #[serde(default = "default_sequential_spacing_ms")]
    pub sequential_spacing_ms: u64,

    #[serde(default = "default_max_sequential_spacing_ms")]
    pub max_sequential_spacing_ms: u64,

    #[serde(default = "default_coordination_interval_ms")]
    pub coordination_interval_ms: u64,

    /// Lease after which an active job counts as stalled
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    /// Sleep of an idle worker between claims
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

fn default_concurrency() -> usize { 4 }
fn default_processor() -> ProcessorKind { ProcessorKind::Parallel }
fn default_sequential_spacing_ms() -> u64 { 1_000 }
fn default_max_sequential_spacing_ms() -> u64 { 10_000 }
fn default_coordination_interval_ms() -> u64 { 2_000 }
fn default_stall_timeout_ms() -> u64 { 120_000 }
fn default_idle_poll_ms() -> u64 { 100 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            default_processor: default_processor(),
            sequential_spacing_ms: default_sequential_spacing_ms(),
            max_sequential_spacing_ms: default_max_sequential_spacing_ms(),
            coordination_interval_ms: default_coordination_interval_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl SchedulerConfig {
    /// Pause after a sequential task of `window_index`
    pub fn sequential_spacing(&self, window_index: usize) -> Duration {
        let steps = window_index as u64 + 1;
        let spacing = self
            .sequential_spacing_ms
            .saturating_mul(steps)
            .min(self.max_sequential_spacing_ms);
        Duration::from_millis(spacing)
    }
}

/// Collaborators shared by every worker
#[derive(Clone)]
pub struct SchedulerDeps {
    pub queue: Arc<dyn TaskQueue>,
    pub persistence: Arc<dyn Persistence>,
    pub ledger: Arc<dyn LedgerClient>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub events: EventBus,
}

/// Runtime handle of one tracked bundle
struct BundleControl {
    write_lock: tokio::sync::Mutex<()>,
    paused: AtomicBool,
    parked: parking_lot::Mutex<Vec<BundleTask>>,
    cancel: watch::Sender<bool>,
    min_fee: u64,
    logger: BundleLogger,
    trace: TraceContext,
    started: Instant,
}

impl BundleControl {
    fn new(bundle_id: BundleId, min_fee: u64) -> Self {
        let trace = TraceContext::new("bundle");
        let (cancel, _) = watch::channel(false);
        Self {
            write_lock: tokio::sync::Mutex::new(()),
            paused: AtomicBool::new(false),
            parked: parking_lot::Mutex::new(Vec::new()),
            cancel,
            min_fee,
            logger: BundleLogger::new(bundle_id, trace.correlation_id.clone()),
            trace,
            started: Instant::now(),
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

struct SchedulerInner {
    config: SchedulerConfig,
    retry: RetryConfig,
    queue: Arc<dyn TaskQueue>,
    persistence: Arc<dyn Persistence>,
    ledger: Arc<dyn LedgerClient>,
    breaker: Arc<CircuitBreaker>,
    sequences: SequenceAllocator,
    events: EventBus,
    bundles: DashMap<BundleId, Arc<BundleControl>>,
}

impl SchedulerInner {
    fn control(&self, id: BundleId) -> Option<Arc<BundleControl>> {
        self.bundles.get(&id).map(|c| c.clone())
    }

    fn is_tracked(&self, id: BundleId) -> bool {
        self.bundles.contains_key(&id)
    }

    fn untrack(&self, id: BundleId) {
        if self.bundles.remove(&id).is_some() {
            metrics().active_bundles.dec();
        }
    }

    async fn persist_task(&self, task: &BundleTask) {
        if let Err(e) = self.persistence.update_task_status(task).await {
            warn!(task_id = %task.id, error = %e, "Failed to persist task state");
        }
    }

    /// Persisted record of a job, falling back to the queue copy
    async fn current_task(&self, job: BundleTask) -> BundleTask {
        match self.persistence.list_tasks_by_bundle(job.bundle_id).await {
            Ok(tasks) => tasks.into_iter().find(|t| t.id == job.id).unwrap_or(job),
            Err(e) => {
                warn!(task_id = %job.id, error = %e, "Failed to load persisted task");
                job
            }
        }
    }

    async fn ack(&self, task_id: TaskId) {
        if let Err(e) = self.queue.ack(task_id).await {
            error!(task_id = %task_id, error = %e, "Failed to ack job");
        }
    }
}

/// Schedules bundles onto the task queue and owns the worker pools
pub struct BundleScheduler {
    inner: Arc<SchedulerInner>,
    shutdown: watch::Sender<bool>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl BundleScheduler {
    pub fn new(deps: SchedulerDeps, config: SchedulerConfig, retry: RetryConfig) -> Self {
        let breaker = deps.breakers.get(deps.ledger.endpoint());
        let sequences = SequenceAllocator::new(deps.ledger.clone());
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                retry,
                queue: deps.queue,
                persistence: deps.persistence,
                ledger: deps.ledger,
                breaker,
                sequences,
                events: deps.events,
                bundles: DashMap::new(),
            }),
            shutdown,
            workers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Spawn both processors and the coordination loop
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        info!(
            concurrency = self.inner.config.concurrency,
            backend = ?self.inner.queue.backend(),
            "Starting bundle scheduler"
        );
        workers.push(tokio::spawn(run_parallel(
            self.inner.clone(),
            self.shutdown.subscribe(),
        )));
        workers.push(tokio::spawn(run_sequential(
            self.inner.clone(),
            self.shutdown.subscribe(),
        )));
        workers.push(tokio::spawn(run_coordination(
            self.inner.clone(),
            self.shutdown.subscribe(),
        )));
    }

    /// Stop claiming new jobs. In-flight tasks run to completion.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.inner.queue
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.breaker
    }

    pub fn is_tracked(&self, id: BundleId) -> bool {
        self.inner.is_tracked(id)
    }

    /// Correlation id of a tracked bundle
    pub fn correlation_id(&self, id: BundleId) -> Option<CorrelationId> {
        self.inner
            .control(id)
            .map(|c| c.logger.correlation_id().clone())
    }

    /// Persist the plan's tasks, flip the bundle to executing and enqueue one
    /// job per task at its window's nominal offset.
    pub async fn schedule(
        &self,
        mut bundle: Bundle,
        plan: ExecutionPlan,
        min_fee: u64,
    ) -> EngineResult<Bundle> {
        if bundle.status != BundleStatus::Pending {
            return Err(EngineError::InvalidState {
                bundle_id: bundle.id,
                status: bundle.status,
                action: "schedule",
            });
        }

        let inner = &self.inner;
        if let Err(e) = self.persist_schedule(&mut bundle, &plan).await {
            error!(bundle_id = %bundle.id, error = %e, "Failed to persist bundle schedule");
            self.abort_schedule(&mut bundle, &e.to_string()).await;
            return Err(e.into());
        }

        let control = Arc::new(BundleControl::new(bundle.id, min_fee));
        control
            .logger
            .log_status(BundleStatus::Pending, BundleStatus::Executing);

        inner.bundles.insert(bundle.id, control.clone());
        metrics().active_bundles.inc();

        for task in plan.tasks.iter().cloned() {
            let delay = Duration::from_millis(plan.window_offset_ms(task.window_index));
            if let Err(e) = inner.queue.enqueue(task, delay).await {
                error!(bundle_id = %bundle.id, error = %e, "Failed to enqueue bundle jobs");
                self.abort_schedule(&mut bundle, &e.to_string()).await;
                return Err(e.into());
            }
        }

        control.logger.log_launch(
            plan.tasks.len(),
            plan.total_windows,
            plan.estimated_duration_ms,
        );
        Ok(bundle)
    }

    async fn persist_schedule(
        &self,
        bundle: &mut Bundle,
        plan: &ExecutionPlan,
    ) -> PersistenceResult<()> {
        for task in &plan.tasks {
            self.inner.persistence.create_task(task).await?;
        }
        bundle.total = plan.tasks.len();
        bundle.status = BundleStatus::Executing;
        bundle.started_at = Some(Utc::now());
        self.inner.persistence.update_bundle(bundle).await
    }

    /// Fail a bundle whose schedule could not be completed, cancelling
    /// whatever part of it was already persisted
    async fn abort_schedule(&self, bundle: &mut Bundle, reason: &str) {
        let inner = &self.inner;
        if let Err(e) = inner.queue.purge_bundle(bundle.id).await {
            warn!(
                bundle_id = %bundle.id,
                error = %e,
                "Failed to purge partially scheduled bundle"
            );
        }
        inner.untrack(bundle.id);

        let now = Utc::now();
        match inner.persistence.list_tasks_by_bundle(bundle.id).await {
            Ok(tasks) => {
                for mut task in tasks.into_iter().filter(|t| !t.status.is_terminal()) {
                    task.status = TaskStatus::Cancelled;
                    task.finished_at = Some(now);
                    inner.persist_task(&task).await;
                }
            }
            Err(e) => warn!(bundle_id = %bundle.id, error = %e, "Failed to load aborted tasks"),
        }
        bundle.status = BundleStatus::Failed;
        bundle.failure_reason = Some(format!("scheduling failed: {reason}"));
        bundle.completed_at = Some(now);
        if let Err(e) = inner.persistence.update_bundle(bundle).await {
            warn!(bundle_id = %bundle.id, error = %e, "Failed to persist aborted bundle");
        }
    }

    async fn tracked_control(
        &self,
        id: BundleId,
        action: &'static str,
    ) -> EngineResult<Arc<BundleControl>> {
        if let Some(control) = self.inner.control(id) {
            return Ok(control);
        }
        match self.inner.persistence.get_bundle(id).await? {
            Some(bundle) => Err(EngineError::InvalidState {
                bundle_id: id,
                status: bundle.status,
                action,
            }),
            None => Err(EngineError::NotFound(id)),
        }
    }

    async fn load_bundle(&self, id: BundleId) -> EngineResult<Bundle> {
        self.inner
            .persistence
            .get_bundle(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    /// Stop dispatching the bundle's jobs. In-flight tasks still finish.
    pub async fn pause(&self, id: BundleId) -> EngineResult<Bundle> {
        let control = self.tracked_control(id, "pause").await?;
        let _guard = control.write_lock.lock().await;

        let mut bundle = self.load_bundle(id).await?;
        if bundle.status != BundleStatus::Executing {
            return Err(EngineError::InvalidState {
                bundle_id: id,
                status: bundle.status,
                action: "pause",
            });
        }

        control.paused.store(true, Ordering::SeqCst);
        bundle.status = BundleStatus::Paused;
        self.inner.persistence.update_bundle(&bundle).await?;
        control
            .logger
            .log_status(BundleStatus::Executing, BundleStatus::Paused);
        Ok(bundle)
    }

    /// Re-enqueue jobs parked while paused
    pub async fn resume(&self, id: BundleId) -> EngineResult<Bundle> {
        let control = self.tracked_control(id, "resume").await?;
        let _guard = control.write_lock.lock().await;

        let mut bundle = self.load_bundle(id).await?;
        if bundle.status != BundleStatus::Paused {
            return Err(EngineError::InvalidState {
                bundle_id: id,
                status: bundle.status,
                action: "resume",
            });
        }

        control.paused.store(false, Ordering::SeqCst);
        bundle.status = BundleStatus::Executing;
        self.inner.persistence.update_bundle(&bundle).await?;

        let parked: Vec<BundleTask> = control.parked.lock().drain(..).collect();
        let count = parked.len();
        for task in parked {
            self.inner.queue.enqueue(task, Duration::ZERO).await?;
        }
        control
            .logger
            .log_status(BundleStatus::Paused, BundleStatus::Executing);
        debug!(bundle_id = %id, requeued = count, "Re-enqueued parked jobs");
        Ok(bundle)
    }

    /// Purge queued jobs, drop parked ones, wake pending delays and mark the
    /// bundle failed with reason `cancelled`. Results of tasks still in
    /// flight are discarded.
    pub async fn cancel(&self, id: BundleId) -> EngineResult<Bundle> {
        let inner = &self.inner;
        let control = inner.control(id);
        let _guard = match control.as_ref() {
            Some(c) => Some(c.write_lock.lock().await),
            None => None,
        };

        let mut bundle = self.load_bundle(id).await?;
        if bundle.status.is_terminal() {
            return Err(EngineError::InvalidState {
                bundle_id: id,
                status: bundle.status,
                action: "cancel",
            });
        }

        if let Some(c) = control.as_ref() {
            c.cancel.send_replace(true);
        }
        let mut removed: HashSet<TaskId> =
            inner.queue.purge_bundle(id).await?.into_iter().collect();
        if let Some(c) = control.as_ref() {
            removed.extend(c.parked.lock().drain(..).map(|t| t.id));
        }

        // Waiting also covers jobs already claimed by a worker that has not
        // reached them yet; the worker acks them once it sees the bundle gone
        let mut tasks = inner.persistence.list_tasks_by_bundle(id).await?;
        let now = Utc::now();
        let mut cancelled = 0u64;
        for task in tasks.iter_mut() {
            let queued = removed.contains(&task.id) || task.status == TaskStatus::Waiting;
            if queued && !task.status.is_terminal() {
                task.status = TaskStatus::Cancelled;
                task.finished_at = Some(now);
                inner.persist_task(task).await;
                cancelled += 1;
            }
        }
        metrics().tasks_cancelled.inc_by(cancelled);

        let completed = count_status(&tasks, TaskStatus::Completed);
        let failed = count_status(&tasks, TaskStatus::Failed);
        let previous = bundle.status;
        bundle.set_counts(completed, failed);
        bundle.analytics = BundleAnalytics::from_tasks(&tasks);
        bundle.status = BundleStatus::Failed;
        bundle.failure_reason = Some(CANCELLED_REASON.to_string());
        bundle.completed_at = Some(now);
        inner.persistence.update_bundle(&bundle).await?;
        inner.untrack(id);

        if let Some(c) = control.as_ref() {
            c.logger.log_status(previous, BundleStatus::Failed);
        }
        info!(bundle_id = %id, cancelled, "Bundle cancelled");
        inner.events.publish(EngineEvent::BundleCompleted {
            bundle_id: id,
            status: bundle.status,
            completed: bundle.completed,
            failed: bundle.failed,
            total: bundle.total,
            failure_reason: bundle.failure_reason.clone(),
        });
        Ok(bundle)
    }

    /// Recompute analytics of a tracked bundle. Returns `false` once the
    /// bundle is no longer tracked.
    pub async fn refresh_analytics(&self, id: BundleId) -> EngineResult<bool> {
        let Some(control) = self.inner.control(id) else {
            return Ok(false);
        };
        let _guard = control.write_lock.lock().await;
        if !self.inner.is_tracked(id) {
            return Ok(false);
        }

        let mut bundle = self.load_bundle(id).await?;
        let tasks = self.inner.persistence.list_tasks_by_bundle(id).await?;
        bundle.analytics = BundleAnalytics::from_tasks(&tasks);
        self.inner.persistence.update_bundle(&bundle).await?;
        Ok(true)
    }

    /// Run one coordination pass immediately
    pub async fn coordinate_now(&self) {
        coordinator::tick(&self.inner).await;
    }
}

impl Drop for BundleScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn count_status(tasks: &[BundleTask], status: TaskStatus) -> usize {
    tasks.iter().filter(|t| t.status == status).count()
}

/// Returns `true` when shutdown was signalled during the wait
async fn idle_wait(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => false,
        _ = shutdown.changed() => true,
    }
}

async fn run_parallel(inner: Arc<SchedulerInner>, mut shutdown: watch::Receiver<bool>) {
    let permits = Arc::new(Semaphore::new(inner.config.concurrency.max(1)));
    let idle = Duration::from_millis(inner.config.idle_poll_ms);

    loop {
        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        match inner.queue.claim(ProcessorKind::Parallel).await {
            Ok(Some(task)) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    processor::run_task(inner, task).await;
                });
            }
            Ok(None) => {
                drop(permit);
                if idle_wait(idle, &mut shutdown).await {
                    break;
                }
            }
            Err(e) => {
                drop(permit);
                error!(error = %e, "Parallel processor failed to claim a job");
                if idle_wait(idle, &mut shutdown).await {
                    break;
                }
            }
        }
    }
    debug!("Parallel processor stopped");
}

async fn run_sequential(inner: Arc<SchedulerInner>, mut shutdown: watch::Receiver<bool>) {
    let idle = Duration::from_millis(inner.config.idle_poll_ms);

    loop {
        let wait = match inner.queue.claim(ProcessorKind::Sequential).await {
            Ok(Some(task)) => {
                let spacing = inner.config.sequential_spacing(task.window_index);
                processor::run_task(inner.clone(), task).await;
                spacing
            }
            Ok(None) => idle,
            Err(e) => {
                error!(error = %e, "Sequential processor failed to claim a job");
                idle
            }
        };
        if idle_wait(wait, &mut shutdown).await {
            break;
        }
    }
    debug!("Sequential processor stopped");
}

async fn run_coordination(inner: Arc<SchedulerInner>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_millis(inner.config.coordination_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => coordinator::tick(&inner).await,
            _ = shutdown.changed() => break,
        }
    }
    debug!("Coordination loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerConfig;
    use crate::planner::{FeePolicy, MarketConditions, PlanContext, Planner, TimingPolicy};
    use crate::queue::{MemoryQueue, QueueCounts};
    use crate::simulation::{InMemoryPersistence, SimulatedLedger};
    use crate::test_utils::{sample_accounts, transfer_template};
    use rand::{rngs::StdRng, SeedableRng};

    struct Harness {
        scheduler: BundleScheduler,
        persistence: Arc<InMemoryPersistence>,
        ledger: Arc<SimulatedLedger>,
        events: EventBus,
    }

    fn harness(config: SchedulerConfig) -> Harness {
        let persistence = Arc::new(InMemoryPersistence::new());
        let ledger = Arc::new(SimulatedLedger::new("sim"));
        let events = EventBus::new(256);
        let retry = RetryConfig {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
            jitter_factor: 0.0,
        };
        let scheduler = BundleScheduler::new(
            SchedulerDeps {
                queue: Arc::new(MemoryQueue::new()),
                persistence: persistence.clone(),
                ledger: ledger.clone(),
                breakers: Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default())),
                events: events.clone(),
            },
            config,
            retry,
        );
        Harness {
            scheduler,
            persistence,
            ledger,
            events,
        }
    }

    async fn launch(h: &Harness, accounts: usize, processor: ProcessorKind) -> Bundle {
        let timing = TimingPolicy {
            delay_range: crate::planner::DelayRange { min: 100, max: 200 },
            wallets_per_window: 2,
            window_size_ms: 1_000,
        };
        let planner = Planner::new(timing, FeePolicy::default()).unwrap();
        let accounts = sample_accounts(accounts);
        let template = transfer_template();
        let bundle = Bundle::new("test", accounts.len());
        h.persistence.create_bundle(&bundle).await.unwrap();
        let plan = planner.plan(
            &PlanContext {
                bundle_id: bundle.id,
                accounts: &accounts,
                template: &template,
                processor,
                max_attempts: 3,
                market: MarketConditions { fee_rate: 10.0 },
            },
            &mut StdRng::seed_from_u64(7),
        );
        h.scheduler.schedule(bundle, plan, 1_000).await.unwrap()
    }

    async fn wait_terminal(h: &Harness, id: BundleId) -> Bundle {
        for _ in 0..600 {
            h.scheduler.coordinate_now().await;
            let bundle = h.persistence.get_bundle(id).await.unwrap().unwrap();
            if bundle.status.is_terminal() {
                return bundle;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("bundle {id} did not finish");
    }

    #[test]
    fn test_sequential_spacing_is_capped() {
        let config = SchedulerConfig {
            sequential_spacing_ms: 1_000,
            max_sequential_spacing_ms: 2_500,
            ..Default::default()
        };
        assert_eq!(config.sequential_spacing(0), Duration::from_millis(1_000));
        assert_eq!(config.sequential_spacing(1), Duration::from_millis(2_000));
        assert_eq!(config.sequential_spacing(7), Duration::from_millis(2_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_bundle_completes() {
        let h = harness(SchedulerConfig::default());
        h.scheduler.start();
        let mut rx = h.events.subscribe();

        let bundle = launch(&h, 5, ProcessorKind::Parallel).await;
        assert_eq!(bundle.status, BundleStatus::Executing);
        assert!(bundle.started_at.is_some());

        let done = wait_terminal(&h, bundle.id).await;
        assert_eq!(done.status, BundleStatus::Completed);
        assert_eq!(done.completed, 5);
        assert_eq!(done.progress_percentage, 100.0);
        assert!(done.analytics.total_fees_paid >= 5 * 5_000);
        assert!(!h.scheduler.is_tracked(bundle.id));

        let mut completed_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::TaskCompleted { .. }) {
                completed_events += 1;
            }
        }
        assert_eq!(completed_events, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_bundle_completes_in_order() {
        let h = harness(SchedulerConfig {
            sequential_spacing_ms: 50,
            ..Default::default()
        });
        h.scheduler.start();

        let bundle = launch(&h, 3, ProcessorKind::Sequential).await;
        let done = wait_terminal(&h, bundle.id).await;
        assert_eq!(done.status, BundleStatus::Completed);
        assert_eq!(h.ledger.submissions().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_fails_bundle() {
        let h = harness(SchedulerConfig::default());
        h.ledger
            .fail_next(crate::errors::LedgerError::Rejected("execution reverted".to_string()));
        h.scheduler.start();

        let bundle = launch(&h, 2, ProcessorKind::Parallel).await;
        let done = wait_terminal(&h, bundle.id).await;
        assert_eq!(done.status, BundleStatus::Failed);
        assert_eq!(done.failed, 1);
        assert_eq!(done.completed, 1);
        assert_eq!(h.ledger.submissions().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_parks_and_resume_requeues() {
        let h = harness(SchedulerConfig::default());
        let bundle = launch(&h, 4, ProcessorKind::Parallel).await;

        h.scheduler.pause(bundle.id).await.unwrap();
        h.scheduler.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.ledger.submissions().is_empty());

        let resumed = h.scheduler.resume(bundle.id).await.unwrap();
        assert_eq!(resumed.status, BundleStatus::Executing);
        let done = wait_terminal(&h, bundle.id).await;
        assert_eq!(done.status, BundleStatus::Completed);
        assert_eq!(done.completed, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_transitions_rejected() {
        let h = harness(SchedulerConfig::default());
        let bundle = launch(&h, 1, ProcessorKind::Parallel).await;

        let err = h.scheduler.resume(bundle.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { action: "resume", .. }));

        h.scheduler.cancel(bundle.id).await.unwrap();
        let err = h.scheduler.pause(bundle.id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState { status: BundleStatus::Failed, .. }
        ));
        let err = h.scheduler.cancel(BundleId::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_purges_queued_jobs() {
        let h = harness(SchedulerConfig::default());
        let mut rx = h.events.subscribe();
        let bundle = launch(&h, 6, ProcessorKind::Parallel).await;

        let cancelled = h.scheduler.cancel(bundle.id).await.unwrap();
        assert_eq!(cancelled.status, BundleStatus::Failed);
        assert_eq!(cancelled.failure_reason.as_deref(), Some(CANCELLED_REASON));

        let tasks = h.persistence.list_tasks_by_bundle(bundle.id).await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Cancelled));
        assert_eq!(h.scheduler.queue().counts().await.unwrap().waiting, 0);
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::BundleCompleted { status: BundleStatus::Failed, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_covers_claimed_jobs() {
        let h = harness(SchedulerConfig::default());
        let bundle = launch(&h, 2, ProcessorKind::Parallel).await;
        let queue = h.scheduler.queue().clone();

        // Claimed by a worker that has not run it yet
        let claimed = queue.claim(ProcessorKind::Parallel).await.unwrap().unwrap();
        h.scheduler.cancel(bundle.id).await.unwrap();

        let tasks = h.persistence.list_tasks_by_bundle(bundle.id).await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Cancelled));

        super::processor::run_task(h.scheduler.inner.clone(), claimed).await;
        assert_eq!(queue.counts().await.unwrap(), QueueCounts::default());
        assert!(h.ledger.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_requeued_after_cancel_is_discarded() {
        let h = harness(SchedulerConfig::default());
        let bundle = launch(&h, 1, ProcessorKind::Parallel).await;
        let queue = h.scheduler.queue().clone();
        let mut job = queue.claim(ProcessorKind::Parallel).await.unwrap().unwrap();

        h.scheduler.cancel(bundle.id).await.unwrap();

        // A failure handler that passed its cancel check before the cancel
        job.attempt = 1;
        job.status = TaskStatus::Waiting;
        h.persistence.update_task_status(&job).await.unwrap();
        queue.retry(job, Duration::ZERO).await.unwrap();

        let requeued = queue.claim(ProcessorKind::Parallel).await.unwrap().unwrap();
        super::processor::run_task(h.scheduler.inner.clone(), requeued).await;

        let tasks = h.persistence.list_tasks_by_bundle(bundle.id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Cancelled);
        assert!(tasks[0].finished_at.is_some());
        assert_eq!(queue.counts().await.unwrap(), QueueCounts::default());
        assert!(h.ledger.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_consumes_no_sequence() {
        let h = harness(SchedulerConfig::default());
        for _ in 0..20 {
            h.scheduler.breaker().record_failure();
        }
        let bundle = launch(&h, 1, ProcessorKind::Parallel).await;
        let queue = h.scheduler.queue().clone();
        let job = queue.claim(ProcessorKind::Parallel).await.unwrap().unwrap();
        let account = job.account.clone();

        super::processor::run_task(h.scheduler.inner.clone(), job).await;

        assert!(h.ledger.submissions().is_empty());
        assert_eq!(h.ledger.sequence_queries(), 0);
        assert_eq!(h.scheduler.inner.sequences.peek(&account).await, None);

        let tasks = h.persistence.list_tasks_by_bundle(bundle.id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Waiting);
        assert!(tasks[0]
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("Circuit breaker open")));
        assert_eq!(queue.counts().await.unwrap().delayed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_persistence_failure_fails_bundle() {
        let h = harness(SchedulerConfig::default());
        h.persistence.fail_task_creates_after(2);

        let planner = Planner::new(TimingPolicy::default(), FeePolicy::default()).unwrap();
        let accounts = sample_accounts(4);
        let template = transfer_template();
        let bundle = Bundle::new("broken", accounts.len());
        h.persistence.create_bundle(&bundle).await.unwrap();
        let plan = planner.plan(
            &PlanContext {
                bundle_id: bundle.id,
                accounts: &accounts,
                template: &template,
                processor: ProcessorKind::Parallel,
                max_attempts: 3,
                market: MarketConditions { fee_rate: 10.0 },
            },
            &mut StdRng::seed_from_u64(7),
        );

        let err = h.scheduler.schedule(bundle.clone(), plan, 1_000).await.unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        assert!(!h.scheduler.is_tracked(bundle.id));

        let stored = h.persistence.get_bundle(bundle.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BundleStatus::Failed);
        assert!(stored.completed_at.is_some());
        assert!(stored
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.starts_with("scheduling failed")));

        let tasks = h.persistence.list_tasks_by_bundle(bundle.id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Cancelled));
        assert_eq!(h.scheduler.queue().counts().await.unwrap(), QueueCounts::default());
    }
}
