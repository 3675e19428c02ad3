//! Worker-side protocol: drain a broker and coordinate each job's
//! running/completed/failed/retrying transitions with the database.
//!
//! The job payload carries only a task id, so the worker fetches everything
//! else from the database under an explicitly constructed root context (a
//! worker serves every tenant's queue).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use foreman_db::models::TaskStatus;
use foreman_db::{Db, TenantContext};

use crate::broker::{Broker, Job};
use crate::error::Error;
use crate::tasks::{self, UpdateTask};

pub mod registry;

pub use registry::{HandlerRegistry, TaskHandler};

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long one dequeue call waits before polling again.
    pub poll_timeout: Duration,
    /// Base delay of the exponential retry backoff.
    pub backoff_base: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_secs(2),
        }
    }
}

/// What happened to one dequeued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded; task completed.
    Completed,
    /// Handler failed with retry budget left; task set to `retrying`.
    Retrying { delay: Duration },
    /// Handler failed on the final attempt; task failed.
    Failed,
    /// The task no longer exists; the job was discarded at the broker.
    Discarded,
    /// The task was cancelled (or already finished); the handler did not run.
    Skipped,
}

/// Exponential backoff: base on the first retry, doubling per attempt.
pub fn backoff_delay(base: Duration, attempts_made: u32) -> Duration {
    let exponent = attempts_made.saturating_sub(1).min(16);
    base * 2u32.pow(exponent)
}

/// A queue worker bound to one broker and one handler registry.
pub struct Worker {
    db: Db,
    ctx: TenantContext,
    broker: Arc<dyn Broker>,
    registry: HandlerRegistry,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(db: Db, broker: Arc<dyn Broker>, registry: HandlerRegistry) -> Self {
        Self::with_config(db, broker, registry, WorkerConfig::default())
    }

    pub fn with_config(
        db: Db,
        broker: Arc<dyn Broker>,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> Self {
        let ctx = TenantContext::root("queue worker: job payloads carry no tenant");
        Self {
            db,
            ctx,
            broker,
            registry,
            config,
        }
    }

    /// Drain the broker until the token is cancelled.
    ///
    /// A failed job never stops the loop; the error is logged and the next
    /// job is fetched.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if self.registry.is_empty() {
            anyhow::bail!("refusing to start a worker with no registered handlers");
        }
        info!(handlers = ?self.registry.task_types(), "worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                dequeued = self.broker.dequeue(self.config.poll_timeout) => {
                    match dequeued {
                        Ok(Some(job)) => {
                            if let Err(err) = self.process_job(&job).await {
                                warn!(job_id = %job.id, task_id = %job.task_id, error = %err, "job processing failed");
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(error = %err, "dequeue failed; backing off");
                            tokio::time::sleep(self.config.poll_timeout).await;
                        }
                    }
                }
            }
        }
        info!("worker stopped");
        Ok(())
    }

    /// Run the per-job state machine for one dequeued job.
    pub async fn process_job(&self, job: &Job) -> Result<JobOutcome, Error> {
        // 1. Resolve the task. A missing task means the run or task was
        //    deleted since enqueue; the job can never succeed.
        let task = match tasks::get_task(&self.db, &self.ctx, job.task_id).await {
            Ok(task) => task,
            Err(Error::NotFound(_)) => {
                self.broker
                    .discard(job, "task no longer exists")
                    .await
                    .map_err(Error::Internal)?;
                warn!(job_id = %job.id, task_id = %job.task_id, "discarded job for missing task");
                return Ok(JobOutcome::Discarded);
            }
            Err(err) => return Err(err),
        };

        // 2. A cancelled task is acknowledged without running the handler
        //    and without touching its status.
        if task.status == TaskStatus::Cancelled {
            self.broker.complete(job).await.map_err(Error::Internal)?;
            info!(task_id = %task.id, "skipping cancelled task");
            return Ok(JobOutcome::Skipped);
        }

        // 3. Record that this attempt is running. A task that reached a
        //    terminal status through another path (stale redelivery) is
        //    acknowledged instead.
        let update = UpdateTask {
            status: Some(TaskStatus::Running),
            queue_job_id: Some(job.id.clone()),
            ..UpdateTask::default()
        };
        match tasks::update_task(&self.db, &self.ctx, task.id, update).await {
            Ok(_) => {}
            Err(Error::InvalidTransition(_)) => {
                self.broker.complete(job).await.map_err(Error::Internal)?;
                info!(task_id = %task.id, "skipping already-finished task");
                return Ok(JobOutcome::Skipped);
            }
            Err(err) => return Err(err),
        }

        // 4. Dispatch. The registry reports a missing handler as an
        //    ordinary handler error, so retry classification covers it.
        let result = self.registry.dispatch(&task).await;

        match result {
            Ok(output) => {
                let update = UpdateTask {
                    status: Some(TaskStatus::Completed),
                    output_data: Some(output),
                    ..UpdateTask::default()
                };
                tasks::update_task(&self.db, &self.ctx, task.id, update).await?;
                self.broker.complete(job).await.map_err(Error::Internal)?;
                info!(task_id = %task.id, attempt = job.attempts_made, "task completed");
                Ok(JobOutcome::Completed)
            }
            Err(handler_err) => {
                let error_data = json!({
                    "message": handler_err.to_string(),
                    "stack": format!("{handler_err:?}"),
                });
                if job.attempts_made >= job.max_attempts {
                    let update = UpdateTask {
                        status: Some(TaskStatus::Failed),
                        error_data: Some(error_data),
                        ..UpdateTask::default()
                    };
                    tasks::update_task(&self.db, &self.ctx, task.id, update).await?;
                    self.broker
                        .discard(job, &handler_err.to_string())
                        .await
                        .map_err(Error::Internal)?;
                    warn!(
                        task_id = %task.id,
                        attempt = job.attempts_made,
                        error = %handler_err,
                        "task failed permanently"
                    );
                    Ok(JobOutcome::Failed)
                } else {
                    let update = UpdateTask {
                        status: Some(TaskStatus::Retrying),
                        error_data: Some(error_data),
                        ..UpdateTask::default()
                    };
                    tasks::update_task(&self.db, &self.ctx, task.id, update).await?;
                    let delay = backoff_delay(self.config.backoff_base, job.attempts_made);
                    self.broker
                        .retry(job, delay)
                        .await
                        .map_err(Error::Internal)?;
                    warn!(
                        task_id = %task.id,
                        attempt = job.attempts_made,
                        delay_ms = delay.as_millis() as u64,
                        error = %handler_err,
                        "task scheduled for retry"
                    );
                    Ok(JobOutcome::Retrying { delay })
                }
            }
        }
    }
}
