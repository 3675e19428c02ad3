//! Task manager: lifecycle of units of work, including retry accounting and
//! maintenance of the parent run's task counters.

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use foreman_db::models::{now_millis, SortOrder, Task, TaskStatus};
use foreman_db::queries::runs;
use foreman_db::queries::tasks::{self, NewTask, TaskSortBy, TaskUpdate};
use foreman_db::{Db, TenantContext};

use crate::error::Error;
use crate::page::{validate_page, Page};

/// Maximum page size for task listings.
pub const MAX_LIST_LIMIT: i64 = 100;

/// Default and upper bound for `max_retries`.
pub const DEFAULT_MAX_RETRIES: i32 = 3;
pub const MAX_MAX_RETRIES: i32 = 10;

/// Request to create a task under an existing run.
#[derive(Debug, Clone)]
pub struct CreateTask {
    pub run_id: Uuid,
    pub parent_task_id: Option<Uuid>,
    pub task_type: String,
    pub input_data: Value,
    pub metadata: Option<Value>,
    pub max_retries: Option<i32>,
}

/// Patch for an existing task. Unset fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct UpdateTask {
    pub status: Option<TaskStatus>,
    pub output_data: Option<Value>,
    pub error_data: Option<Value>,
    pub metadata: Option<Value>,
    pub queue_job_id: Option<String>,
}

/// Listing parameters for tasks.
#[derive(Debug, Clone)]
pub struct ListTasks {
    pub run_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    pub limit: i64,
    pub offset: i64,
    pub sort_by: TaskSortBy,
    pub sort_order: SortOrder,
}

impl Default for ListTasks {
    fn default() -> Self {
        Self {
            run_id: None,
            status: None,
            limit: 20,
            offset: 0,
            sort_by: TaskSortBy::CreatedAt,
            sort_order: SortOrder::Desc,
        }
    }
}

/// Create a task and increment the parent run's `total_tasks`, atomically.
pub async fn create_task(db: &Db, ctx: &TenantContext, req: CreateTask) -> Result<Task, Error> {
    let org_id = ctx
        .org_id()
        .ok_or_else(|| Error::Forbidden("task creation requires an organization context".into()))?;
    if req.task_type.is_empty() {
        return Err(Error::InvalidInput("type is required".into()));
    }
    if req.task_type.len() > 255 {
        return Err(Error::InvalidInput("type exceeds 255 characters".into()));
    }
    if req.input_data.is_null() {
        return Err(Error::InvalidInput("inputData is required".into()));
    }
    let max_retries = req
        .max_retries
        .unwrap_or(DEFAULT_MAX_RETRIES)
        .clamp(0, MAX_MAX_RETRIES);

    let mut tx = ctx.begin(db).await?;

    let run = runs::get_run(&mut tx, req.run_id)
        .await?
        .ok_or_else(|| Error::not_found("run", req.run_id))?;

    if let Some(parent_id) = req.parent_task_id {
        tasks::get_task_in_run(&mut tx, parent_id, run.id)
            .await?
            .ok_or_else(|| Error::not_found("parent task", parent_id))?;
    }

    let new = NewTask {
        run_id: run.id,
        parent_task_id: req.parent_task_id,
        org_id: org_id.to_owned(),
        task_type: req.task_type,
        input_data: req.input_data,
        metadata: req.metadata,
        max_retries,
    };
    let task = tasks::insert_task(&mut tx, &new).await?;
    runs::increment_total_tasks(&mut tx, run.id, now_millis()).await?;

    tx.commit().await.context("failed to commit task creation")?;

    info!(task_id = %task.id, run_id = %run.id, task_type = %task.task_type, "task created");
    Ok(task)
}

/// Fetch a task visible under the context.
pub async fn get_task(db: &Db, ctx: &TenantContext, id: Uuid) -> Result<Task, Error> {
    let mut tx = ctx.begin(db).await?;
    let task = tasks::get_task(&mut tx, id)
        .await?
        .ok_or_else(|| Error::not_found("task", id))?;
    tx.commit().await.context("failed to commit task fetch")?;
    Ok(task)
}

/// Apply a patch to a task, enforcing transition rules and maintaining the
/// parent run's counters.
///
/// The task row is locked before the run row; holding that order everywhere
/// keeps concurrent terminal transitions of sibling tasks deadlock-free.
pub async fn update_task(
    db: &Db,
    ctx: &TenantContext,
    id: Uuid,
    patch: UpdateTask,
) -> Result<Task, Error> {
    let mut tx = ctx.begin(db).await?;
    let current = tasks::get_task_for_update(&mut tx, id)
        .await?
        .ok_or_else(|| Error::not_found("task", id))?;

    let now = now_millis();
    let mut retry_count = current.retry_count;
    let mut queued_at = current.queued_at;
    let mut started_at = current.started_at;
    let mut completed_at = current.completed_at;
    let mut duration_ms = current.duration_ms;
    let mut completed_delta = 0;
    let mut failed_delta = 0;

    let status = match patch.status {
        Some(next) => {
            if current.status.is_terminal() && next != current.status {
                return Err(Error::InvalidTransition(format!(
                    "task {id} is {}; cannot transition to {next}",
                    current.status
                )));
            }
            match next {
                TaskStatus::Queued => {
                    if queued_at.is_none() {
                        queued_at = Some(now);
                    }
                }
                TaskStatus::Running => {
                    if started_at.is_none() {
                        started_at = Some(now);
                    }
                }
                TaskStatus::Retrying => {
                    retry_count += 1;
                }
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                    if completed_at.is_none() {
                        completed_at = Some(now);
                        duration_ms = Some(now - started_at.unwrap_or(current.created_at));
                    }
                    // A task already in a terminal status never counts twice,
                    // even if the caller re-asserts it.
                    if !current.status.is_terminal() {
                        match next {
                            TaskStatus::Completed => completed_delta = 1,
                            TaskStatus::Failed => failed_delta = 1,
                            _ => {}
                        }
                    }
                }
                TaskStatus::Pending => {}
            }
            next
        }
        None => current.status,
    };

    let update = TaskUpdate {
        status,
        output_data: patch.output_data,
        error_data: patch.error_data,
        metadata: patch.metadata,
        queue_job_id: patch.queue_job_id,
        retry_count,
        queued_at,
        started_at,
        completed_at,
        duration_ms,
        updated_at: now,
    };
    let task = tasks::update_task_row(&mut tx, id, &update).await?;

    if completed_delta > 0 || failed_delta > 0 {
        runs::apply_task_counters(&mut tx, task.run_id, completed_delta, failed_delta, now).await?;
    }

    tx.commit().await.context("failed to commit task update")?;

    debug!(task_id = %id, status = %task.status, retry_count = task.retry_count, "task updated");
    Ok(task)
}

/// List tasks visible under the context.
pub async fn list_tasks(
    db: &Db,
    ctx: &TenantContext,
    params: ListTasks,
) -> Result<Page<Task>, Error> {
    validate_page(params.limit, params.offset, MAX_LIST_LIMIT)?;

    let mut tx = ctx.begin(db).await?;
    let total = tasks::count_tasks(&mut tx, params.run_id, params.status).await?;
    let items = tasks::list_tasks(
        &mut tx,
        params.run_id,
        params.status,
        params.sort_by,
        params.sort_order,
        params.limit,
        params.offset,
    )
    .await?;
    tx.commit().await.context("failed to commit task listing")?;

    Ok(Page {
        items,
        total,
        limit: params.limit,
        offset: params.offset,
    })
}
