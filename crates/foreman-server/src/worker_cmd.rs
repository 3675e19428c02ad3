//! `foreman worker` subcommand: drain the task queue with the built-in
//! handlers.
//!
//! Real deployments embed [`foreman_core::worker::Worker`] in their own
//! binaries and register domain handlers; this subcommand ships an `echo`
//! handler so the full enqueue/execute loop can be smoke-tested without
//! external code.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use foreman_core::broker::redis::{QueueNames, RedisBroker};
use foreman_core::worker::{HandlerRegistry, TaskHandler, Worker};
use foreman_db::models::Task;
use foreman_db::pool;

use crate::config::ServerConfig;

/// Echoes the task's input back as its output.
struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn task_type(&self) -> &str {
        "echo"
    }

    async fn handle(&self, task: &Task) -> Result<Value> {
        Ok(task.input_data.clone())
    }
}

/// Connect to the database and broker, then drain jobs until Ctrl+C.
pub async fn run_worker(config: &ServerConfig) -> Result<()> {
    let db = pool::create_db(&config.db).await?;
    let broker = RedisBroker::connect(
        &config.redis_url,
        QueueNames {
            tasks: config.tasks_queue.clone(),
            results: config.results_queue.clone(),
        },
    )
    .await?;

    let mut registry = HandlerRegistry::new();
    registry.register(EchoHandler);

    let worker = Worker::new(db, Arc::new(broker), registry);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("shutdown requested");
        signal_token.cancel();
    });

    worker.run(shutdown).await
}
