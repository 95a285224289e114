//! Redis-backed durable queue
//!
//! Key layout under `{prefix}`:
//! - `jobs`                 HASH  task id -> task JSON
//! - `wait:{processor}`     LIST  ready task ids, FIFO
//! - `delayed:{processor}`  ZSET  task id scored by ready time (epoch ms)
//! - `active`               ZSET  task id scored by claim time (epoch ms)
//! - `bundle:{bundle_id}`   SET   ids of a bundle's stored jobs
//!
//! A job's `jobs` entry and bundle set membership live exactly as long as
//! the job is queued or claimed. Ack, purge, stall takeover and drain all
//! remove both.

use super::{BackendKind, QueueCounts, QueueResult, TaskQueue};
use crate::errors::QueueError;
use crate::types::{BundleId, BundleTask, ProcessorKind, TaskId};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

const PROCESSORS: [ProcessorKind; 2] = [ProcessorKind::Parallel, ProcessorKind::Sequential];

/// Redis scripts for atomic operations
mod scripts {
    use redis::Script;

    /// Promote due delayed jobs, then pop one ready job into the active set.
    pub fn claim() -> Script {
        Script::new(
            r#"
            local delayed = KEYS[1]
            local wait = KEYS[2]
            local active = KEYS[3]
            local jobs = KEYS[4]
            local now = tonumber(ARGV[1])

            local due = redis.call('ZRANGEBYSCORE', delayed, '-inf', now, 'LIMIT', 0, 256)
            for _, id in ipairs(due) do
                redis.call('ZREM', delayed, id)
                redis.call('RPUSH', wait, id)
            end

            local id = redis.call('LPOP', wait)
            if not id then
                return false
            end
            redis.call('ZADD', active, now, id)
            return redis.call('HGET', jobs, id)
            "#,
        )
    }

    /// Remove one job from waiting/delayed. Returns 1 if it was queued.
    pub fn remove_queued() -> Script {
        Script::new(
            r#"
            local removed = 0
            removed = removed + redis.call('LREM', KEYS[1], 0, ARGV[1])
            removed = removed + redis.call('LREM', KEYS[2], 0, ARGV[1])
            removed = removed + redis.call('ZREM', KEYS[3], ARGV[1])
            removed = removed + redis.call('ZREM', KEYS[4], ARGV[1])
            if removed > 0 then
                redis.call('HDEL', KEYS[5], ARGV[1])
                redis.call('SREM', KEYS[6], ARGV[1])
                return 1
            end
            return 0
            "#,
        )
    }
}

/// Durable task queue on Redis
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    prefix: String,
    op_timeout: Duration,
    claim_script: Script,
    remove_script: Script,
}

impl fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQueue")
            .field("prefix", &self.prefix)
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl RedisQueue {
    pub async fn connect(
        redis_url: &str,
        prefix: &str,
        op_timeout: Duration,
    ) -> QueueResult<Self> {
        info!("Connecting to Redis queue at {}", redis_url);

        let client = redis::Client::open(redis_url).map_err(|e| QueueError::Connection {
            backend: "redis".to_string(),
            message: format!("invalid redis url: {e}"),
        })?;
        let mut conn = ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;

        info!("Successfully connected to Redis queue");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            op_timeout,
            claim_script: scripts::claim(),
            remove_script: scripts::remove_queued(),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn wait_key(&self, processor: ProcessorKind) -> String {
        self.key(&format!("wait:{}", processor.as_str()))
    }

    fn delayed_key(&self, processor: ProcessorKind) -> String {
        self.key(&format!("delayed:{}", processor.as_str()))
    }

    fn bundle_key(&self, bundle_id: BundleId) -> String {
        self.key(&format!("bundle:{bundle_id}"))
    }

    async fn timed<T, Fut>(&self, fut: Fut) -> QueueResult<T>
    where
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(QueueError::from),
            Err(_) => Err(QueueError::Timeout(self.op_timeout.as_millis() as u64)),
        }
    }

    async fn store(&self, task: &BundleTask, delay: Duration) -> QueueResult<()> {
        let json = serde_json::to_string(task)?;
        let id = task.id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(self.key("jobs"), &id, json)
            .ignore()
            .sadd(self.bundle_key(task.bundle_id), &id)
            .ignore()
            .zrem(self.key("active"), &id)
            .ignore();
        if delay.is_zero() {
            pipe.rpush(self.wait_key(task.processor), &id).ignore();
        } else {
            let ready_at = now_ms() + delay.as_millis() as i64;
            pipe.zadd(self.delayed_key(task.processor), &id, ready_at)
                .ignore();
        }

        let mut conn = self.conn.clone();
        self.timed(pipe.query_async::<()>(&mut conn)).await
    }

    async fn load(&self, ids: &[String]) -> QueueResult<Vec<BundleTask>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let jobs_key = self.key("jobs");
        let raw: Vec<Option<String>> = self
            .timed(async {
                redis::cmd("HMGET")
                    .arg(&jobs_key)
                    .arg(ids)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(QueueError::from))
            .collect()
    }

    /// Queue the removal of stored payloads and bundle membership
    fn forget(&self, pipe: &mut redis::Pipeline, tasks: &[BundleTask]) {
        let jobs_key = self.key("jobs");
        for task in tasks {
            let id = task.id.to_string();
            pipe.hdel(&jobs_key, &id)
                .ignore()
                .srem(self.bundle_key(task.bundle_id), &id)
                .ignore();
        }
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    fn backend(&self) -> BackendKind {
        BackendKind::Durable
    }

    async fn enqueue(&self, task: BundleTask, delay: Duration) -> QueueResult<()> {
        debug!(task_id = %task.id, delay_ms = delay.as_millis() as u64, "Queue ENQUEUE");
        self.store(&task, delay).await
    }

    async fn claim(&self, processor: ProcessorKind) -> QueueResult<Option<BundleTask>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self
            .timed(
                self.claim_script
                    .key(self.delayed_key(processor))
                    .key(self.wait_key(processor))
                    .key(self.key("active"))
                    .key(self.key("jobs"))
                    .arg(now_ms())
                    .invoke_async(&mut conn),
            )
            .await?;
        raw.map(|json| serde_json::from_str(&json).map_err(QueueError::from))
            .transpose()
    }

    async fn ack(&self, task_id: TaskId) -> QueueResult<()> {
        let id = task_id.to_string();
        // The payload names the bundle set to leave
        let tasks = self.load(std::slice::from_ref(&id)).await?;

        let mut pipe = redis::pipe();
        pipe.atomic().zrem(self.key("active"), &id).ignore();
        self.forget(&mut pipe, &tasks);

        let mut conn = self.conn.clone();
        self.timed(pipe.query_async::<()>(&mut conn)).await
    }

    async fn retry(&self, task: BundleTask, delay: Duration) -> QueueResult<()> {
        self.store(&task, delay).await
    }

    async fn purge_bundle(&self, bundle_id: BundleId) -> QueueResult<Vec<TaskId>> {
        let mut conn = self.conn.clone();
        let bundle_key = self.bundle_key(bundle_id);
        let members: Vec<String> = self.timed(conn.smembers(&bundle_key)).await?;

        let mut removed = Vec::new();
        for id in members {
            let hit: i64 = self
                .timed(
                    self.remove_script
                        .key(self.wait_key(ProcessorKind::Parallel))
                        .key(self.wait_key(ProcessorKind::Sequential))
                        .key(self.delayed_key(ProcessorKind::Parallel))
                        .key(self.delayed_key(ProcessorKind::Sequential))
                        .key(self.key("jobs"))
                        .key(&bundle_key)
                        .arg(&id)
                        .invoke_async(&mut conn),
                )
                .await?;
            if hit == 1 {
                if let Ok(uuid) = id.parse() {
                    removed.push(TaskId(uuid));
                }
            }
        }
        Ok(removed)
    }

    async fn take_stalled(&self, lease: Duration) -> QueueResult<Vec<BundleTask>> {
        let mut conn = self.conn.clone();
        let active_key = self.key("active");
        let cutoff = now_ms() - lease.as_millis() as i64;
        let ids: Vec<String> = self
            .timed(conn.zrangebyscore(&active_key, "-inf", cutoff))
            .await?;

        let mut claimed = Vec::new();
        for id in ids {
            // Only the caller that removes the entry owns the stalled job
            let n: i64 = self.timed(conn.zrem(&active_key, &id)).await?;
            if n == 1 {
                claimed.push(id);
            }
        }
        let tasks = self.load(&claimed).await?;
        if !tasks.is_empty() {
            let mut pipe = redis::pipe();
            pipe.atomic();
            self.forget(&mut pipe, &tasks);
            self.timed(pipe.query_async::<()>(&mut conn)).await?;
        }
        Ok(tasks)
    }

    async fn drain(&self) -> QueueResult<Vec<(BundleTask, Duration)>> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let mut out = Vec::new();

        for processor in PROCESSORS {
            let wait_key = self.wait_key(processor);
            let delayed_key = self.delayed_key(processor);

            let ready: Vec<String> = self.timed(conn.lrange(&wait_key, 0, -1)).await?;
            let delayed: Vec<(String, f64)> =
                self.timed(conn.zrange_withscores(&delayed_key, 0, -1)).await?;
            let ready_tasks = self.load(&ready).await?;
            let delayed_ids: Vec<String> = delayed.iter().map(|(id, _)| id.clone()).collect();
            let delayed_tasks = self.load(&delayed_ids).await?;

            let mut pipe = redis::pipe();
            pipe.atomic().del(&wait_key).ignore().del(&delayed_key).ignore();
            self.forget(&mut pipe, &ready_tasks);
            self.forget(&mut pipe, &delayed_tasks);
            self.timed(pipe.query_async::<()>(&mut conn)).await?;

            for task in ready_tasks {
                out.push((task, Duration::ZERO));
            }
            for task in delayed_tasks {
                let id = task.id.to_string();
                let ready_at = delayed
                    .iter()
                    .find(|(d, _)| *d == id)
                    .map(|(_, at)| *at as i64)
                    .unwrap_or(now);
                let remaining = (ready_at - now).max(0) as u64;
                out.push((task, Duration::from_millis(remaining)));
            }
        }
        Ok(out)
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        let mut conn = self.conn.clone();
        let mut counts = QueueCounts::default();
        for processor in PROCESSORS {
            let waiting: usize = self.timed(conn.llen(self.wait_key(processor))).await?;
            let delayed: usize = self.timed(conn.zcard(self.delayed_key(processor))).await?;
            counts.waiting += waiting;
            counts.delayed += delayed;
        }
        counts.active = self.timed(conn.zcard(self.key("active"))).await?;
        Ok(counts)
    }
}
