//! Redis-backed broker.
//!
//! # Key schema
//!
//! | Key | Type | Purpose |
//! |-----|------|---------|
//! | `{queue}` | List | Pending job ids |
//! | `{queue}:delayed` | Sorted set | Job ids scored by ready-time (epoch ms) |
//! | `{queue}:failed` | List | Permanently failed job ids |
//! | `{queue}:job:{id}` | Hash | `task_id`, `attempts_made`, `max_attempts`, `error?` |
//!
//! Delayed jobs are promoted to the pending list by a Lua script so the
//! promotion is a single atomic round-trip.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};
use uuid::Uuid;

use foreman_db::models::now_millis;

use super::{Broker, EnqueueOptions, Job};

/// Promote due delayed jobs onto the pending list.
///
/// KEYS[1] = delayed zset, KEYS[2] = pending list.
/// ARGV[1] = current epoch ms.
/// Returns: number promoted.
const LUA_PROMOTE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('LPUSH', KEYS[2], id)
end
return #due
"#;

/// Queue names used by a [`RedisBroker`].
#[derive(Debug, Clone)]
pub struct QueueNames {
    /// Pending-task list, e.g. `foreman:tasks`.
    pub tasks: String,
    /// Completion-notification list, e.g. `foreman:results`.
    pub results: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            tasks: "foreman:tasks".to_owned(),
            results: "foreman:results".to_owned(),
        }
    }
}

/// Broker backed by a Redis list plus per-job hashes.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    queues: QueueNames,
    promote_due: Script,
}

impl RedisBroker {
    /// Connect to Redis and build a broker over the given queue names.
    pub async fn connect(url: &str, queues: QueueNames) -> Result<Self> {
        let client =
            redis::Client::open(url).with_context(|| format!("invalid redis URL {url}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("failed to connect to redis at {url}"))?;
        Ok(Self {
            conn,
            queues,
            promote_due: Script::new(LUA_PROMOTE_DUE),
        })
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{job_id}", self.queues.tasks)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.queues.tasks)
    }

    fn failed_key(&self) -> String {
        format!("{}:failed", self.queues.tasks)
    }

    async fn promote_due_jobs(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let promoted: i64 = self
            .promote_due
            .key(self.delayed_key())
            .key(&self.queues.tasks)
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await
            .context("failed to promote delayed jobs")?;
        if promoted > 0 {
            debug!(promoted, "promoted delayed jobs");
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, task_id: Uuid, options: EnqueueOptions) -> Result<String> {
        let job_id = Uuid::new_v4().simple().to_string();
        let max_attempts = options.max_attempts.unwrap_or(1).max(1);
        let mut conn = self.conn.clone();

        let _: () = conn
            .hset_multiple(
                self.job_key(&job_id),
                &[
                    ("task_id", task_id.to_string()),
                    ("attempts_made", "0".to_owned()),
                    ("max_attempts", max_attempts.to_string()),
                ],
            )
            .await
            .context("failed to store job hash")?;

        match options.delay {
            Some(delay) if !delay.is_zero() => {
                let ready_at = now_millis() + delay.as_millis() as i64;
                let _: () = conn
                    .zadd(self.delayed_key(), &job_id, ready_at)
                    .await
                    .context("failed to schedule delayed job")?;
            }
            _ => {
                let _: () = conn
                    .lpush(&self.queues.tasks, &job_id)
                    .await
                    .context("failed to push job onto queue")?;
            }
        }

        debug!(%task_id, job_id, max_attempts, "enqueued task");
        Ok(job_id)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>> {
        self.promote_due_jobs().await?;

        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn
            .brpop(&self.queues.tasks, timeout.as_secs_f64())
            .await
            .context("failed to pop from queue")?;

        let Some((_, job_id)) = popped else {
            return Ok(None);
        };

        let attempts_made: u32 = conn
            .hincr(self.job_key(&job_id), "attempts_made", 1)
            .await
            .context("failed to count job attempt")?;
        let fields: Option<(String, u32)> = {
            let task_id: Option<String> = conn
                .hget(self.job_key(&job_id), "task_id")
                .await
                .context("failed to read job task id")?;
            let max_attempts: Option<u32> = conn
                .hget(self.job_key(&job_id), "max_attempts")
                .await
                .context("failed to read job attempt budget")?;
            task_id.zip(max_attempts)
        };

        let Some((task_id, max_attempts)) = fields else {
            warn!(job_id, "dequeued job with missing hash; dropping");
            return Ok(None);
        };
        let task_id = task_id
            .parse::<Uuid>()
            .with_context(|| format!("job {job_id} carries malformed task id"))?;

        Ok(Some(Job {
            id: job_id,
            task_id,
            attempts_made,
            max_attempts,
        }))
    }

    async fn complete(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(self.job_key(&job.id))
            .await
            .context("failed to delete job hash")?;
        let _: () = conn
            .lpush(&self.queues.results, job.task_id.to_string())
            .await
            .context("failed to publish result notification")?;
        debug!(job_id = %job.id, task_id = %job.task_id, "job completed");
        Ok(())
    }

    async fn retry(&self, job: &Job, delay: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let ready_at = now_millis() + delay.as_millis() as i64;
        let _: () = conn
            .zadd(self.delayed_key(), &job.id, ready_at)
            .await
            .context("failed to re-enqueue job for retry")?;
        debug!(job_id = %job.id, delay_ms = delay.as_millis() as u64, "job scheduled for retry");
        Ok(())
    }

    async fn discard(&self, job: &Job, reason: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(self.job_key(&job.id), "error", reason)
            .await
            .context("failed to record job error")?;
        let _: () = conn
            .lpush(self.failed_key(), &job.id)
            .await
            .context("failed to move job to failed list")?;
        warn!(job_id = %job.id, task_id = %job.task_id, reason, "job discarded");
        Ok(())
    }
}
