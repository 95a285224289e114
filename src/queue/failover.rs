//! Durable -> in-process failover wrapper

use super::{BackendKind, MemoryQueue, QueueConfig, QueueCounts, QueueResult, TaskQueue};
use crate::metrics::metrics;
use crate::types::{BundleId, BundleTask, ProcessorKind, TaskId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Owns the live backend and swaps to an in-process queue after
/// `failover_threshold` consecutive backend failures.
///
/// A single operation never surfaces a backend failure: it is retried on
/// the durable backend until the threshold trips, then rerun on the
/// in-process queue. Errors that are not backend failures pass through.
pub struct FailoverQueue {
    current: RwLock<Arc<dyn TaskQueue>>,
    consecutive_failures: AtomicU32,
    threshold: u32,
    retry_pause: Duration,
    swap_lock: tokio::sync::Mutex<()>,
}

impl FailoverQueue {
    pub fn new(initial: Arc<dyn TaskQueue>, config: &QueueConfig) -> Self {
        Self {
            current: RwLock::new(initial),
            consecutive_failures: AtomicU32::new(0),
            threshold: config.failover_threshold.max(1),
            retry_pause: Duration::from_millis(config.retry_pause_ms),
            swap_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn current(&self) -> Arc<dyn TaskQueue> {
        self.current.read().clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    async fn with_backend<T, F, Fut>(&self, op: &'static str, f: F) -> QueueResult<T>
    where
        F: Fn(Arc<dyn TaskQueue>) -> Fut,
        Fut: Future<Output = QueueResult<T>>,
    {
        loop {
            let queue = self.current();
            match f(queue.clone()).await {
                Ok(value) => {
                    if queue.backend() == BackendKind::Durable {
                        self.consecutive_failures.store(0, Ordering::Relaxed);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_backend_failure() && queue.backend() == BackendKind::Durable => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        op,
                        failures,
                        threshold = self.threshold,
                        error = %e,
                        "Durable queue operation failed"
                    );
                    if failures >= self.threshold {
                        self.fail_over().await;
                    } else {
                        tokio::time::sleep(self.retry_pause).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replace the durable backend with an in-process queue, carrying over
    /// whatever waiting and delayed jobs can still be read.
    async fn fail_over(&self) {
        let _guard = self.swap_lock.lock().await;
        let durable = self.current();
        if durable.backend() != BackendKind::Durable {
            return;
        }

        let replacement: Arc<dyn TaskQueue> = Arc::new(MemoryQueue::new());
        match durable.drain().await {
            Ok(jobs) => {
                let carried = jobs.len();
                for (task, delay) in jobs {
                    if let Err(e) = replacement.enqueue(task, delay).await {
                        error!(error = %e, "Failed to carry job over to in-process queue");
                    }
                }
                debug!(carried, "Carried jobs over to in-process queue");
            }
            Err(e) => {
                error!(error = %e, "Could not drain durable queue; queued jobs stay behind");
            }
        }

        *self.current.write() = replacement;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        metrics().queue_failovers.inc();
        warn!("Switched task queue to in-process backend");
    }
}

#[async_trait]
impl TaskQueue for FailoverQueue {
    fn backend(&self) -> BackendKind {
        self.current().backend()
    }

    async fn enqueue(&self, task: BundleTask, delay: Duration) -> QueueResult<()> {
        self.with_backend("enqueue", |q| {
            let task = task.clone();
            async move { q.enqueue(task, delay).await }
        })
        .await
    }

    async fn claim(&self, processor: ProcessorKind) -> QueueResult<Option<BundleTask>> {
        self.with_backend("claim", |q| async move { q.claim(processor).await })
            .await
    }

    async fn ack(&self, task_id: TaskId) -> QueueResult<()> {
        self.with_backend("ack", |q| async move { q.ack(task_id).await })
            .await
    }

    async fn retry(&self, task: BundleTask, delay: Duration) -> QueueResult<()> {
        self.with_backend("retry", |q| {
            let task = task.clone();
            async move { q.retry(task, delay).await }
        })
        .await
    }

    async fn purge_bundle(&self, bundle_id: BundleId) -> QueueResult<Vec<TaskId>> {
        self.with_backend("purge_bundle", |q| async move { q.purge_bundle(bundle_id).await })
            .await
    }

    async fn take_stalled(&self, lease: Duration) -> QueueResult<Vec<BundleTask>> {
        self.with_backend("take_stalled", |q| async move { q.take_stalled(lease).await })
            .await
    }

    async fn drain(&self) -> QueueResult<Vec<(BundleTask, Duration)>> {
        self.with_backend("drain", |q| async move { q.drain().await })
            .await
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        self.with_backend("counts", |q| async move { q.counts().await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::QueueError;
    use crate::test_utils::sample_task;
    use std::sync::atomic::AtomicBool;

    /// Durable stand-in whose writes and claims fail while `down` is set.
    /// Reads used by drain still reach the stored jobs.
    struct FlakyQueue {
        inner: MemoryQueue,
        down: AtomicBool,
        calls: AtomicU32,
    }

    impl FlakyQueue {
        fn new() -> Self {
            Self {
                inner: MemoryQueue::new(),
                down: AtomicBool::new(false),
                calls: AtomicU32::new(0),
            }
        }

        fn check(&self) -> QueueResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(QueueError::Connection {
                    backend: "flaky".to_string(),
                    message: "connection refused".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl TaskQueue for FlakyQueue {
        fn backend(&self) -> BackendKind {
            BackendKind::Durable
        }
        async fn enqueue(&self, task: BundleTask, delay: Duration) -> QueueResult<()> {
            self.check()?;
            self.inner.enqueue(task, delay).await
        }
        async fn claim(&self, processor: ProcessorKind) -> QueueResult<Option<BundleTask>> {
            self.check()?;
            self.inner.claim(processor).await
        }
        async fn ack(&self, task_id: TaskId) -> QueueResult<()> {
            self.check()?;
            self.inner.ack(task_id).await
        }
        async fn retry(&self, task: BundleTask, delay: Duration) -> QueueResult<()> {
            self.check()?;
            self.inner.retry(task, delay).await
        }
        async fn purge_bundle(&self, bundle_id: BundleId) -> QueueResult<Vec<TaskId>> {
            self.check()?;
            self.inner.purge_bundle(bundle_id).await
        }
        async fn take_stalled(&self, lease: Duration) -> QueueResult<Vec<BundleTask>> {
            self.check()?;
            self.inner.take_stalled(lease).await
        }
        async fn drain(&self) -> QueueResult<Vec<(BundleTask, Duration)>> {
            self.inner.drain().await
        }
        async fn counts(&self) -> QueueResult<QueueCounts> {
            self.check()?;
            self.inner.counts().await
        }
    }

    fn config(threshold: u32) -> QueueConfig {
        QueueConfig {
            failover_threshold: threshold,
            retry_pause_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_after_threshold_keeps_jobs() {
        let flaky = Arc::new(FlakyQueue::new());
        let queue = FailoverQueue::new(flaky.clone(), &config(3));
        let bundle = BundleId::new();

        let first = sample_task(bundle, ProcessorKind::Parallel);
        let later = sample_task(bundle, ProcessorKind::Parallel);
        queue.enqueue(first.clone(), Duration::ZERO).await.unwrap();
        queue.enqueue(later.clone(), Duration::from_secs(2)).await.unwrap();
        assert_eq!(queue.backend(), BackendKind::Durable);

        flaky.down.store(true, Ordering::SeqCst);
        let before = flaky.calls.load(Ordering::SeqCst);

        // The claim itself succeeds; the caller never sees the outage
        let claimed = queue.claim(ProcessorKind::Parallel).await.unwrap();
        assert_eq!(claimed.map(|t| t.id), Some(first.id));
        assert_eq!(flaky.calls.load(Ordering::SeqCst) - before, 3);
        assert_eq!(queue.backend(), BackendKind::InProcess);

        tokio::time::advance(Duration::from_secs(2)).await;
        let claimed = queue.claim(ProcessorKind::Parallel).await.unwrap();
        assert_eq!(claimed.map(|t| t.id), Some(later.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_below_threshold_stays_durable() {
        let flaky = Arc::new(FlakyQueue::new());
        let queue = Arc::new(FailoverQueue::new(flaky.clone(), &config(3)));
        flaky.down.store(true, Ordering::SeqCst);

        let recover = {
            let flaky = flaky.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(15)).await;
                flaky.down.store(false, Ordering::SeqCst);
            })
        };

        let counts = queue.counts().await.unwrap();
        recover.await.unwrap();
        assert_eq!(counts, QueueCounts::default());
        assert_eq!(queue.backend(), BackendKind::Durable);
        assert_eq!(queue.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_non_backend_errors_pass_through() {
        struct Corrupt;

        #[async_trait]
        impl TaskQueue for Corrupt {
            fn backend(&self) -> BackendKind {
                BackendKind::Durable
            }
            async fn enqueue(&self, _: BundleTask, _: Duration) -> QueueResult<()> {
                Err(QueueError::Serialization("bad payload".to_string()))
            }
            async fn claim(&self, _: ProcessorKind) -> QueueResult<Option<BundleTask>> {
                Ok(None)
            }
            async fn ack(&self, _: TaskId) -> QueueResult<()> {
                Ok(())
            }
            async fn retry(&self, _: BundleTask, _: Duration) -> QueueResult<()> {
                Ok(())
            }
            async fn purge_bundle(&self, _: BundleId) -> QueueResult<Vec<TaskId>> {
                Ok(Vec::new())
            }
            async fn take_stalled(&self, _: Duration) -> QueueResult<Vec<BundleTask>> {
                Ok(Vec::new())
            }
            async fn drain(&self) -> QueueResult<Vec<(BundleTask, Duration)>> {
                Ok(Vec::new())
            }
            async fn counts(&self) -> QueueResult<QueueCounts> {
                Ok(QueueCounts::default())
            }
        }

        let queue = FailoverQueue::new(Arc::new(Corrupt), &config(1));
        let err = queue
            .enqueue(sample_task(BundleId::new(), ProcessorKind::Parallel), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Serialization(_)));
        assert_eq!(queue.backend(), BackendKind::Durable);
    }
}
