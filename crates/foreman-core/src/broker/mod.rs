//! Queue broker abstraction.
//!
//! The broker is a transport for work-available signals, nothing more: the
//! only domain field a job carries is the task id. Everything else a worker
//! needs (type, input, retry budget) is fetched from the database, which
//! stays the single source of truth. This keeps broker capabilities (payload
//! size, visibility semantics) out of workflow semantics and makes the
//! broker swappable.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use foreman_db::models::Task;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// A dequeued job. `attempts_made` includes the current attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub task_id: Uuid,
    pub attempts_made: u32,
    pub max_attempts: u32,
}

/// Transport-level options for enqueueing.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Maximum delivery attempts before the broker gives up. Defaults to 1.
    pub max_attempts: Option<u32>,
    /// Delay before the job becomes available to workers.
    pub delay: Option<Duration>,
}

/// A durable at-least-once queue carrying opaque task identifiers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a job whose only payload is the task id. Returns the broker's
    /// job id.
    async fn enqueue(&self, task_id: Uuid, options: EnqueueOptions) -> Result<String>;

    /// Wait up to `timeout` for a job. Dequeueing counts as an attempt.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>>;

    /// Acknowledge successful processing.
    async fn complete(&self, job: &Job) -> Result<()>;

    /// Re-enqueue the job to run again after `delay`.
    async fn retry(&self, job: &Job, delay: Duration) -> Result<()>;

    /// Permanently fail the job, recording the reason at the broker level.
    async fn discard(&self, job: &Job, reason: &str) -> Result<()>;
}

/// Enqueue a task under the ID-only contract, defaulting the broker's
/// attempt budget from the task's `max_retries` (always at least one
/// delivery).
pub async fn enqueue_task(broker: &dyn Broker, task: &Task) -> Result<String> {
    let max_attempts = task.max_retries.max(1) as u32;
    broker
        .enqueue(
            task.id,
            EnqueueOptions {
                max_attempts: Some(max_attempts),
                delay: None,
            },
        )
        .await
}
