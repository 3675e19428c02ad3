//! Task handler registration and dispatch.
//!
//! Workers route each fetched task to the handler registered for its
//! `type`. Dispatch lives here so the "no handler" case is an ordinary
//! handler error: the worker classifies it for retry like any other
//! failure instead of special-casing it.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use foreman_db::models::Task;

/// User code executed for one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The task `type` this handler serves.
    fn task_type(&self) -> &str;

    /// Execute the task. The returned value becomes the task's
    /// `output_data`.
    async fn handle(&self, task: &Task) -> Result<Value>;
}

/// The handlers one worker process serves, keyed by task type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the type it reports. Registering a second
    /// handler for the same type replaces the first; that is almost always
    /// a wiring mistake, so it is logged.
    pub fn register(&mut self, handler: impl TaskHandler + 'static) {
        let task_type = handler.task_type().to_owned();
        if self
            .handlers
            .insert(task_type.clone(), Box::new(handler))
            .is_some()
        {
            warn!(task_type, "replaced an already-registered task handler");
        }
    }

    /// Run the handler registered for `task.type`.
    ///
    /// An unregistered type is a handler error, not a routing special case:
    /// the worker's retry classification applies to it unchanged.
    pub async fn dispatch(&self, task: &Task) -> Result<Value> {
        match self.handlers.get(&task.task_type) {
            Some(handler) => handler.handle(task).await,
            None => anyhow::bail!(
                "no handler registered for task type {:?}",
                task.task_type
            ),
        }
    }

    /// The served task types, sorted for stable startup logs.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Whether any handler is registered. A worker with an empty registry
    /// can only fail jobs, which is worth refusing at startup.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
