//! Execution of one claimed job

use super::{BundleControl, SchedulerInner};
use crate::circuit_breaker::BreakerError;
use crate::errors::{LedgerError, TaskError};
use crate::events::EngineEvent;
use crate::metrics::{metrics, Timer};
use crate::planner::fees::effective_fee;
use crate::ports::{ActivityLog, SubmitParams, SubmitReceipt};
use crate::types::{BundleTask, TaskStatus};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn, Instrument};

/// Resolves once the cancel flag is set
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone; the bundle can no longer be cancelled
            std::future::pending::<()>().await;
        }
    }
}

pub(super) async fn run_task(inner: Arc<SchedulerInner>, mut task: BundleTask) {
    let Some(control) = inner.control(task.bundle_id) else {
        // Claimed before a cancel untracked the bundle, or requeued by a
        // retry that raced it
        debug!(task_id = %task.id, bundle_id = %task.bundle_id, "Job of untracked bundle");
        let task = inner.current_task(task).await;
        discard(&inner, task).await;
        return;
    };

    if control.is_cancelled() {
        discard(&inner, task).await;
        return;
    }

    {
        // Resume drains `parked` under the same lock
        let _guard = control.write_lock.lock().await;
        if control.is_paused() {
            debug!(task_id = %task.id, "Bundle paused, parking job");
            let task_id = task.id;
            control.parked.lock().push(task);
            inner.ack(task_id).await;
            return;
        }
    }

    if task.attempt >= task.max_attempts {
        task.last_error = Some("attempts exhausted".to_string());
        fail_terminal(&inner, &control, task).await;
        return;
    }

    task.attempt += 1;
    task.status = TaskStatus::Active;
    task.started_at.get_or_insert_with(Utc::now);
    inner.persist_task(&task).await;

    let span = control.trace.child_span("task").span();
    metrics().active_tasks.inc();
    execute(&inner, &control, task).instrument(span).await;
    metrics().active_tasks.dec();
}

async fn execute(inner: &Arc<SchedulerInner>, control: &Arc<BundleControl>, mut task: BundleTask) {
    // Retries wait out their backoff in the queue instead
    if task.attempt == 1 && task.delay_ms > 0 {
        let mut cancel_rx = control.cancel.subscribe();
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(task.delay_ms)) => false,
            _ = wait_cancelled(&mut cancel_rx) => true,
        };
        if cancelled {
            discard(inner, task).await;
            return;
        }
    }

    let fee = effective_fee(task.template.base_fee, task.fee_multiplier, control.min_fee);
    let timer = Timer::new();
    let outcome = submit(inner, control, &task, fee).await;
    let latency_ms = timer.elapsed_ms();

    if control.is_cancelled() || !inner.is_tracked(task.bundle_id) {
        discard(inner, task).await;
        return;
    }

    match outcome {
        Ok(receipt) => {
            task.status = TaskStatus::Completed;
            task.tx_hash = Some(receipt.hash.clone());
            task.fee_paid = receipt.fee_paid.or(Some(fee));
            task.last_error = None;
            task.finished_at = Some(Utc::now());
            inner.persist_task(&task).await;
            log_activity(inner, &task, "confirmed", &receipt.hash).await;

            control
                .logger
                .log_task_success(task.id, &receipt.hash, latency_ms);
            metrics().tasks_completed.inc();
            inner.events.publish(EngineEvent::TaskCompleted {
                bundle_id: task.bundle_id,
                task_id: task.id,
                account_id: task.account.id.clone(),
                tx_hash: receipt.hash,
                attempt: task.attempt,
            });
            inner.ack(task.id).await;
        }
        Err(err) => handle_failure(inner, control, task, err).await,
    }
}

async fn submit(
    inner: &SchedulerInner,
    control: &BundleControl,
    task: &BundleTask,
    fee: u64,
) -> Result<SubmitReceipt, TaskError> {
    let timer = Timer::new();
    let result = inner
        .breaker
        .execute(|| submit_with_sequence(inner, control, task, fee))
        .await;
    timer.observe_duration(&metrics().submit_latency);

    match result {
        Ok(receipt) => Ok(receipt),
        Err(BreakerError::Open { endpoint }) => Err(TaskError::CircuitOpen { endpoint }),
        Err(BreakerError::Inner(e)) => Err(e.into()),
    }
}

/// Runs only once the breaker admits the call, so a short-circuited attempt
/// never consumes a sequence number
async fn submit_with_sequence(
    inner: &SchedulerInner,
    control: &BundleControl,
    task: &BundleTask,
    fee: u64,
) -> Result<SubmitReceipt, LedgerError> {
    let sequence = inner.sequences.next(&task.account).await?;
    control
        .logger
        .log_task_submitted(task.id, &task.account.address, sequence, fee);

    let params = SubmitParams {
        task_id: task.id,
        account: task.account.clone(),
        template: task.template.clone(),
        sequence,
        fee,
        private_submission: task.private_submission,
    };

    metrics().tasks_submitted.inc();
    match inner.ledger.submit(params).await {
        Ok(receipt) => {
            // A concurrent resync may have rewound past this one
            inner.sequences.observe(&task.account, sequence + 1).await;
            Ok(receipt)
        }
        Err(e) => {
            inner.sequences.release(&task.account, sequence).await;
            Err(e)
        }
    }
}

async fn handle_failure(
    inner: &Arc<SchedulerInner>,
    control: &Arc<BundleControl>,
    mut task: BundleTask,
    err: TaskError,
) {
    if err.is_sequence_mismatch() {
        if let Err(e) = inner.sequences.resync(&task.account).await {
            warn!(account = %task.account.address, error = %e, "Sequence resync failed");
        }
    }

    let will_retry = err.is_retryable() && task.attempt < task.max_attempts;
    let message = err.to_string();
    task.last_error = Some(message.clone());
    control
        .logger
        .log_task_failure(task.id, &message, task.attempt, will_retry);
    inner.events.publish(EngineEvent::TaskFailed {
        bundle_id: task.bundle_id,
        task_id: task.id,
        account_id: task.account.id.clone(),
        error: message,
        attempt: task.attempt,
        will_retry,
    });

    if !will_retry {
        fail_terminal(inner, control, task).await;
        return;
    }

    task.status = TaskStatus::Waiting;
    inner.persist_task(&task).await;
    metrics().tasks_retried.inc();

    let backoff = inner.retry.backoff(task.attempt);
    debug!(
        task_id = %task.id,
        attempt = task.attempt,
        backoff_ms = backoff.as_millis() as u64,
        "Requeueing task"
    );
    if let Err(e) = inner.queue.retry(task, backoff).await {
        warn!(error = %e, "Failed to requeue task");
    }
}

async fn fail_terminal(
    inner: &Arc<SchedulerInner>,
    control: &Arc<BundleControl>,
    mut task: BundleTask,
) {
    task.status = TaskStatus::Failed;
    task.finished_at = Some(Utc::now());
    inner.persist_task(&task).await;
    let reason = task.last_error.clone().unwrap_or_default();
    log_activity(inner, &task, "failed", &reason).await;

    metrics().tasks_failed.inc();
    control.logger.warn(&format!("task {} failed terminally: {reason}", task.id));
    inner.ack(task.id).await;
}

/// Drop a job whose bundle was cancelled
async fn discard(inner: &Arc<SchedulerInner>, mut task: BundleTask) {
    if !task.status.is_terminal() {
        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(Utc::now());
        inner.persist_task(&task).await;
        metrics().tasks_cancelled.inc();
    }
    debug!(task_id = %task.id, "Discarded job of cancelled bundle");
    inner.ack(task.id).await;
}

async fn log_activity(inner: &SchedulerInner, task: &BundleTask, outcome: &str, detail: &str) {
    let entry = ActivityLog {
        bundle_id: task.bundle_id,
        task_id: task.id,
        account_id: task.account.id.clone(),
        action: format!("{}:{outcome}", task.template.kind.label()),
        message: format!("attempt {}/{}: {detail}", task.attempt, task.max_attempts),
        created_at: Utc::now(),
    };
    if let Err(e) = inner.persistence.create_activity_log(&entry).await {
        warn!(task_id = %task.id, error = %e, "Failed to write activity log");
    }
}
