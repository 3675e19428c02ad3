//! In-process broker with the same observable behavior as the Redis one.
//!
//! Used by tests and local development; not durable. The dequeue loop polls
//! instead of blocking, which is fine at test timescales.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use foreman_db::models::now_millis;

use super::{Broker, EnqueueOptions, Job};

#[derive(Debug, Clone)]
struct StoredJob {
    task_id: Uuid,
    attempts_made: u32,
    max_attempts: u32,
    error: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<String>,
    /// (ready_at epoch ms, job id)
    delayed: Vec<(i64, String)>,
    jobs: HashMap<String, StoredJob>,
    failed: Vec<String>,
    results: Vec<Uuid>,
}

impl Inner {
    fn promote_due(&mut self, now: i64) {
        let mut remaining = Vec::with_capacity(self.delayed.len());
        for (ready_at, id) in self.delayed.drain(..) {
            if ready_at <= now {
                self.pending.push_back(id);
            } else {
                remaining.push((ready_at, id));
            }
        }
        self.delayed = remaining;
    }
}

/// An in-memory at-least-once queue.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs currently waiting (excluding delayed ones).
    pub fn pending_len(&self) -> usize {
        self.inner.lock().expect("broker lock poisoned").pending.len()
    }

    /// Number of jobs scheduled for a later retry.
    pub fn delayed_len(&self) -> usize {
        self.inner.lock().expect("broker lock poisoned").delayed.len()
    }

    /// Ids of permanently failed jobs, with their recorded errors.
    pub fn failed_jobs(&self) -> Vec<(String, Option<String>)> {
        let inner = self.inner.lock().expect("broker lock poisoned");
        inner
            .failed
            .iter()
            .map(|id| (id.clone(), inner.jobs.get(id).and_then(|j| j.error.clone())))
            .collect()
    }

    /// Task ids published to the results queue.
    pub fn results(&self) -> Vec<Uuid> {
        self.inner.lock().expect("broker lock poisoned").results.clone()
    }

    /// Make all delayed jobs immediately available. Tests use this instead
    /// of sleeping through backoff delays.
    pub fn drain_delays(&self) {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        inner.promote_due(i64::MAX);
    }

    fn try_dequeue(&self) -> Result<Option<Job>> {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        inner.promote_due(now_millis());
        let Some(id) = inner.pending.pop_front() else {
            return Ok(None);
        };
        let job = inner
            .jobs
            .get_mut(&id)
            .with_context(|| format!("job {id} has no stored record"))?;
        job.attempts_made += 1;
        Ok(Some(Job {
            id,
            task_id: job.task_id,
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
        }))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, task_id: Uuid, options: EnqueueOptions) -> Result<String> {
        let job_id = Uuid::new_v4().simple().to_string();
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        inner.jobs.insert(
            job_id.clone(),
            StoredJob {
                task_id,
                attempts_made: 0,
                max_attempts: options.max_attempts.unwrap_or(1).max(1),
                error: None,
            },
        );
        match options.delay {
            Some(delay) if !delay.is_zero() => {
                let ready_at = now_millis() + delay.as_millis() as i64;
                inner.delayed.push((ready_at, job_id.clone()));
            }
            _ => inner.pending.push_back(job_id.clone()),
        }
        Ok(job_id)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.try_dequeue()? {
                return Ok(Some(job));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn complete(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        inner.jobs.remove(&job.id);
        inner.results.push(job.task_id);
        Ok(())
    }

    async fn retry(&self, job: &Job, delay: Duration) -> Result<()> {
        let ready_at = now_millis() + delay.as_millis() as i64;
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        inner.delayed.push((ready_at, job.id.clone()));
        Ok(())
    }

    async fn discard(&self, job: &Job, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        if let Some(stored) = inner.jobs.get_mut(&job.id) {
            stored.error = Some(reason.to_owned());
        }
        inner.failed.push(job.id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_dequeue_counts_attempts() {
        let broker = MemoryBroker::new();
        let task_id = Uuid::new_v4();
        let job_id = broker
            .enqueue(
                task_id,
                EnqueueOptions {
                    max_attempts: Some(3),
                    delay: None,
                },
            )
            .await
            .expect("enqueue should succeed");

        let job = broker
            .dequeue(Duration::from_millis(50))
            .await
            .expect("dequeue should succeed")
            .expect("job should be available");
        assert_eq!(job.id, job_id);
        assert_eq!(job.task_id, task_id);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.max_attempts, 3);
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let broker = MemoryBroker::new();
        let result = broker
            .dequeue(Duration::from_millis(20))
            .await
            .expect("dequeue should succeed");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn retry_delays_redelivery() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(Uuid::new_v4(), EnqueueOptions::default())
            .await
            .unwrap();
        let job = broker
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();

        broker.retry(&job, Duration::from_secs(60)).await.unwrap();
        assert_eq!(broker.delayed_len(), 1);
        assert!(broker
            .dequeue(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());

        broker.drain_delays();
        let again = broker
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .expect("job should come back");
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts_made, 2);
    }

    #[tokio::test]
    async fn discard_records_error() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(Uuid::new_v4(), EnqueueOptions::default())
            .await
            .unwrap();
        let job = broker
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();

        broker.discard(&job, "task no longer exists").await.unwrap();
        let failed = broker.failed_jobs();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, job.id);
        assert_eq!(failed[0].1.as_deref(), Some("task no longer exists"));
    }

    #[tokio::test]
    async fn complete_publishes_result() {
        let broker = MemoryBroker::new();
        let task_id = Uuid::new_v4();
        broker
            .enqueue(task_id, EnqueueOptions::default())
            .await
            .unwrap();
        let job = broker
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();

        broker.complete(&job).await.unwrap();
        assert_eq!(broker.results(), vec![task_id]);
        assert_eq!(broker.pending_len(), 0);
    }
}
