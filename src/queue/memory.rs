//! In-process fallback queue

use super::{BackendKind, QueueCounts, QueueResult, TaskQueue};
use crate::types::{BundleId, BundleTask, ProcessorKind, TaskId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct MemoryState {
    parallel: VecDeque<BundleTask>,
    sequential: VecDeque<BundleTask>,
    /// Kept sorted by ready time
    delayed: Vec<(Instant, BundleTask)>,
    active: HashMap<TaskId, (Instant, BundleTask)>,
}

impl MemoryState {
    fn waiting_mut(&mut self, processor: ProcessorKind) -> &mut VecDeque<BundleTask> {
        match processor {
            ProcessorKind::Parallel => &mut self.parallel,
            ProcessorKind::Sequential => &mut self.sequential,
        }
    }

    fn push(&mut self, task: BundleTask, delay: Duration, now: Instant) {
        if delay.is_zero() {
            self.waiting_mut(task.processor).push_back(task);
        } else {
            let ready_at = now + delay;
            let pos = self.delayed.partition_point(|(at, _)| *at <= ready_at);
            self.delayed.insert(pos, (ready_at, task));
        }
    }

    fn promote_due(&mut self, now: Instant) {
        let due = self.delayed.partition_point(|(at, _)| *at <= now);
        let promoted: Vec<_> = self.delayed.drain(..due).collect();
        for (_, task) in promoted {
            self.waiting_mut(task.processor).push_back(task);
        }
    }
}

/// Process-local queue with the same contract as the durable backend.
/// Jobs are lost if the process exits.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    fn backend(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn enqueue(&self, task: BundleTask, delay: Duration) -> QueueResult<()> {
        self.state.lock().push(task, delay, Instant::now());
        Ok(())
    }

    async fn claim(&self, processor: ProcessorKind) -> QueueResult<Option<BundleTask>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.promote_due(now);
        let task = state.waiting_mut(processor).pop_front();
        if let Some(task) = &task {
            state.active.insert(task.id, (now, task.clone()));
        }
        Ok(task)
    }

    async fn ack(&self, task_id: TaskId) -> QueueResult<()> {
        self.state.lock().active.remove(&task_id);
        Ok(())
    }

    async fn retry(&self, task: BundleTask, delay: Duration) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.active.remove(&task.id);
        state.push(task, delay, Instant::now());
        Ok(())
    }

    async fn purge_bundle(&self, bundle_id: BundleId) -> QueueResult<Vec<TaskId>> {
        let mut state = self.state.lock();
        let mut removed = Vec::new();

        for processor in [ProcessorKind::Parallel, ProcessorKind::Sequential] {
            state.waiting_mut(processor).retain(|t| {
                if t.bundle_id == bundle_id {
                    removed.push(t.id);
                    false
                } else {
                    true
                }
            });
        }
        state.delayed.retain(|(_, t)| {
            if t.bundle_id == bundle_id {
                removed.push(t.id);
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn take_stalled(&self, lease: Duration) -> QueueResult<Vec<BundleTask>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let stalled: Vec<TaskId> = state
            .active
            .iter()
            .filter(|(_, (claimed_at, _))| now.duration_since(*claimed_at) >= lease)
            .map(|(id, _)| *id)
            .collect();
        Ok(stalled
            .into_iter()
            .filter_map(|id| state.active.remove(&id).map(|(_, task)| task))
            .collect())
    }

    async fn drain(&self) -> QueueResult<Vec<(BundleTask, Duration)>> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut out: Vec<(BundleTask, Duration)> = state
            .parallel
            .drain(..)
            .chain(state.sequential.drain(..))
            .map(|t| (t, Duration::ZERO))
            .collect();
        out.extend(
            state
                .delayed
                .drain(..)
                .map(|(at, t)| (t, at.saturating_duration_since(now))),
        );
        Ok(out)
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        let state = self.state.lock();
        Ok(QueueCounts {
            waiting: state.parallel.len() + state.sequential.len(),
            delayed: state.delayed.len(),
            active: state.active.len(),
        })
    }
}
