//! Recurring coordination pass over tracked bundles

use super::{count_status, SchedulerInner};
use crate::errors::EngineResult;
use crate::events::EngineEvent;
use crate::metrics::metrics;
use crate::types::{Bundle, BundleAnalytics, BundleId, BundleStatus, TaskStatus};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(super) async fn tick(inner: &Arc<SchedulerInner>) {
    recover_stalled(inner).await;

    let ids: Vec<BundleId> = inner.bundles.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Err(e) = reconcile(inner, id).await {
            warn!(bundle_id = %id, error = %e, "Bundle coordination failed");
        }
    }
}

/// Requeue jobs whose worker exceeded the lease, or fail them when no
/// attempts are left
async fn recover_stalled(inner: &Arc<SchedulerInner>) {
    let lease = Duration::from_millis(inner.config.stall_timeout_ms);
    let stalled = match inner.queue.take_stalled(lease).await {
        Ok(stalled) => stalled,
        Err(e) => {
            warn!(error = %e, "Failed to collect stalled jobs");
            return;
        }
    };

    for job in stalled {
        let Some(control) = inner.control(job.bundle_id) else {
            continue;
        };
        if control.is_cancelled() {
            continue;
        }

        // The queue copy predates the claim; the persisted record is current
        let mut task = inner.current_task(job).await;
        if task.status.is_terminal() {
            continue;
        }

        if task.attempt < task.max_attempts {
            warn!(task_id = %task.id, attempt = task.attempt, "Recovering stalled task");
            task.status = TaskStatus::Waiting;
            task.last_error = Some("stalled: worker lease expired".to_string());
            inner.persist_task(&task).await;
            if let Err(e) = inner.queue.enqueue(task, Duration::ZERO).await {
                warn!(error = %e, "Failed to requeue stalled task");
            }
        } else {
            warn!(task_id = %task.id, attempt = task.attempt, "Stalled task has no attempts left");
            task.status = TaskStatus::Failed;
            task.last_error = Some("stalled on final attempt".to_string());
            task.finished_at = Some(Utc::now());
            inner.persist_task(&task).await;
            metrics().tasks_failed.inc();
            inner.events.publish(EngineEvent::TaskFailed {
                bundle_id: task.bundle_id,
                task_id: task.id,
                account_id: task.account.id.clone(),
                error: "stalled on final attempt".to_string(),
                attempt: task.attempt,
                will_retry: false,
            });
        }
    }
}

/// Refresh counters of one bundle and finish it once no task is outstanding
async fn reconcile(inner: &Arc<SchedulerInner>, id: BundleId) -> EngineResult<()> {
    let Some(control) = inner.control(id) else {
        return Ok(());
    };
    let _guard = control.write_lock.lock().await;
    if !inner.is_tracked(id) {
        return Ok(());
    }

    let Some(mut bundle) = inner.persistence.get_bundle(id).await? else {
        inner.untrack(id);
        return Ok(());
    };
    if bundle.status.is_terminal() {
        inner.untrack(id);
        return Ok(());
    }

    let tasks = inner.persistence.list_tasks_by_bundle(id).await?;
    let completed = count_status(&tasks, TaskStatus::Completed);
    let failed = count_status(&tasks, TaskStatus::Failed);
    let outstanding = tasks.iter().filter(|t| !t.status.is_terminal()).count();

    let before = (bundle.completed, bundle.failed);
    bundle.set_counts(completed, failed);
    let changed = before != (bundle.completed, bundle.failed);

    if outstanding > 0 {
        if changed {
            inner.persistence.update_bundle(&bundle).await?;
            publish_progress(inner, &bundle);
        }
        return Ok(());
    }

    let previous = bundle.status;
    bundle.analytics = BundleAnalytics::from_tasks(&tasks);
    bundle.completed_at = Some(Utc::now());
    if failed == 0 {
        bundle.status = BundleStatus::Completed;
    } else {
        bundle.status = BundleStatus::Failed;
        bundle.failure_reason = Some(format!("{failed} of {} tasks failed", bundle.total));
    }
    inner.persistence.update_bundle(&bundle).await?;
    inner.untrack(id);

    metrics()
        .bundle_duration
        .observe(control.started.elapsed().as_secs_f64());
    control.logger.log_status(previous, bundle.status);
    info!(
        bundle_id = %id,
        status = %bundle.status,
        completed = bundle.completed,
        failed = bundle.failed,
        "Bundle finished"
    );

    if changed {
        publish_progress(inner, &bundle);
    }
    inner.events.publish(EngineEvent::BundleCompleted {
        bundle_id: id,
        status: bundle.status,
        completed: bundle.completed,
        failed: bundle.failed,
        total: bundle.total,
        failure_reason: bundle.failure_reason.clone(),
    });
    Ok(())
}

fn publish_progress(inner: &SchedulerInner, bundle: &Bundle) {
    debug!(
        bundle_id = %bundle.id,
        completed = bundle.completed,
        failed = bundle.failed,
        total = bundle.total,
        "Bundle progress"
    );
    inner.events.publish(EngineEvent::BundleProgress {
        bundle_id: bundle.id,
        completed: bundle.completed,
        failed: bundle.failed,
        total: bundle.total,
        progress_percentage: bundle.progress_percentage,
    });
}
