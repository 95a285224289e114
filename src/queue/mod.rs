//! Task queue backends
//!
//! `TaskQueue` is the single contract the scheduler talks to. Two backends
//! implement it: a Redis-backed durable queue and an in-process fallback.
//! `FailoverQueue` owns whichever is live and swaps durable -> in-process
//! when the durable backend keeps failing.

mod failover;
mod memory;
#[cfg(feature = "redis-queue")]
mod redis_queue;

pub use failover::FailoverQueue;
pub use memory::MemoryQueue;
#[cfg(feature = "redis-queue")]
pub use redis_queue::RedisQueue;

use crate::errors::QueueError;
use crate::types::{BundleId, BundleTask, ProcessorKind, TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Durable,
    InProcess,
}

/// Job counts across all processors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
}

/// Contract shared by both backends
#[async_trait]
pub trait TaskQueue: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Add a job; it becomes claimable after `delay`
    async fn enqueue(&self, task: BundleTask, delay: Duration) -> QueueResult<()>;

    /// Take the next ready job for `processor` and mark it active
    async fn claim(&self, processor: ProcessorKind) -> QueueResult<Option<BundleTask>>;

    /// Forget an active job after a terminal outcome. Unknown ids are ignored.
    async fn ack(&self, task_id: TaskId) -> QueueResult<()>;

    /// Move an active job back to waiting after `delay`
    async fn retry(&self, task: BundleTask, delay: Duration) -> QueueResult<()>;

    /// Remove the bundle's waiting and delayed jobs. Active jobs are left alone.
    async fn purge_bundle(&self, bundle_id: BundleId) -> QueueResult<Vec<TaskId>>;

    /// Remove and return active jobs claimed longer than `lease` ago
    async fn take_stalled(&self, lease: Duration) -> QueueResult<Vec<BundleTask>>;

    /// Remove and return every waiting and delayed job with its remaining delay
    async fn drain(&self) -> QueueResult<Vec<(BundleTask, Duration)>>;

    async fn counts(&self) -> QueueResult<QueueCounts>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Try the durable backend at startup
    #[serde(default)]
    pub durable_enabled: bool,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-operation timeout on the durable backend
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Consecutive durable failures before switching to the in-process queue
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,

    /// Pause between attempts on a failing durable backend
    #[serde(default = "default_retry_pause_ms")]
    pub retry_pause_ms: u64,
}

fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_key_prefix() -> String { "bundle-engine".to_string() }
fn default_connect_attempts() -> u32 { 3 }
fn default_connect_timeout_ms() -> u64 { 2_000 }
fn default_operation_timeout_ms() -> u64 { 2_000 }
fn default_failover_threshold() -> u32 { 3 }
fn default_retry_pause_ms() -> u64 { 50 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            durable_enabled: false,
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            connect_attempts: default_connect_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            failover_threshold: default_failover_threshold(),
            retry_pause_ms: default_retry_pause_ms(),
        }
    }
}

/// Pick the startup backend with a caller-supplied durable connector.
///
/// The connector is tried up to `connect_attempts` times, each bounded by
/// `connect_timeout_ms`. Falls back to `MemoryQueue` when durable mode is
/// disabled or every attempt fails.
pub async fn select_backend_with<F, Fut>(config: &QueueConfig, connect: F) -> Arc<dyn TaskQueue>
where
    F: Fn() -> Fut,
    Fut: Future<Output = QueueResult<Arc<dyn TaskQueue>>>,
{
    if !config.durable_enabled {
        info!("Durable queue disabled, using in-process queue");
        return Arc::new(MemoryQueue::new());
    }

    let timeout = Duration::from_millis(config.connect_timeout_ms);
    for attempt in 1..=config.connect_attempts.max(1) {
        match tokio::time::timeout(timeout, connect()).await {
            Ok(Ok(queue)) => {
                info!(attempt, "Connected to durable queue");
                return queue;
            }
            Ok(Err(e)) => {
                warn!(attempt, error = %e, "Durable queue connection failed");
            }
            Err(_) => {
                warn!(
                    attempt,
                    timeout_ms = config.connect_timeout_ms,
                    "Durable queue connection timed out"
                );
            }
        }
    }

    warn!(
        attempts = config.connect_attempts,
        "Durable queue unavailable, falling back to in-process queue"
    );
    Arc::new(MemoryQueue::new())
}

/// Pick the startup backend from configuration
pub async fn select_backend(config: &QueueConfig) -> Arc<dyn TaskQueue> {
    #[cfg(feature = "redis-queue")]
    {
        select_backend_with(config, || async {
            let queue = RedisQueue::connect(
                &config.redis_url,
                &config.key_prefix,
                Duration::from_millis(config.operation_timeout_ms),
            )
            .await?;
            Ok::<_, QueueError>(Arc::new(queue) as Arc<dyn TaskQueue>)
        })
        .await
    }

    #[cfg(not(feature = "redis-queue"))]
    {
        select_backend_with(config, || async {
            Err(QueueError::Connection {
                backend: "redis".to_string(),
                message: "built without the redis-queue feature".to_string(),
            })
        })
        .await
    }
}
