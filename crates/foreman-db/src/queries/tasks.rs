//! Database query functions for the `tasks` table.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgConnection, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::models::{now_millis, SortOrder, Task, TaskStatus};

/// Sort key for task listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSortBy {
    CreatedAt,
    StartedAt,
    CompletedAt,
}

impl TaskSortBy {
    /// The column this key sorts on.
    pub fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::StartedAt => "started_at",
            Self::CompletedAt => "completed_at",
        }
    }
}

impl fmt::Display for TaskSortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for TaskSortBy {
    type Err = TaskSortByParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(Self::CreatedAt),
            "started_at" => Ok(Self::StartedAt),
            "completed_at" => Ok(Self::CompletedAt),
            other => Err(TaskSortByParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskSortBy`] string.
#[derive(Debug, Clone)]
pub struct TaskSortByParseError(pub String);

impl fmt::Display for TaskSortByParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task sort key: {:?}", self.0)
    }
}

impl std::error::Error for TaskSortByParseError {}

/// Parameters for inserting a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub run_id: Uuid,
    pub parent_task_id: Option<Uuid>,
    pub org_id: String,
    pub task_type: String,
    pub input_data: Value,
    pub metadata: Option<Value>,
    pub max_retries: i32,
}

/// Insert a new task row with a fresh id, `pending` status, zero retries,
/// and `created_at = updated_at = now`.
pub async fn insert_task(conn: &mut PgConnection, new: &NewTask) -> Result<Task> {
    let now = now_millis();
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
         (id, run_id, parent_task_id, org_id, task_type, status, input_data, metadata, \
          max_retries, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8, $9, $9) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.run_id)
    .bind(new.parent_task_id)
    .bind(&new.org_id)
    .bind(&new.task_type)
    .bind(&new.input_data)
    .bind(&new.metadata)
    .bind(new.max_retries)
    .bind(now)
    .fetch_one(conn)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by id.
pub async fn get_task(conn: &mut PgConnection, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a task and take a row lock for the remainder of the transaction.
pub async fn get_task_for_update(conn: &mut PgConnection, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await
        .context("failed to lock task")?;

    Ok(task)
}

/// Fetch a task constrained to a given run (parent-task validation).
pub async fn get_task_in_run(
    conn: &mut PgConnection,
    id: Uuid,
    run_id: Uuid,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1 AND run_id = $2")
        .bind(id)
        .bind(run_id)
        .fetch_optional(conn)
        .await
        .context("failed to fetch task in run")?;

    Ok(task)
}

/// Final column values for a task update, computed by the caller from the
/// transition rules.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub output_data: Option<Value>,
    pub error_data: Option<Value>,
    pub metadata: Option<Value>,
    pub queue_job_id: Option<String>,
    pub retry_count: i32,
    pub queued_at: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub updated_at: i64,
}

/// Write a task update. Payload fields keep their current value when the
/// patch leaves them unset.
pub async fn update_task_row(
    conn: &mut PgConnection,
    id: Uuid,
    update: &TaskUpdate,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = $2, \
             output_data = COALESCE($3, output_data), \
             error_data = COALESCE($4, error_data), \
             metadata = COALESCE($5, metadata), \
             queue_job_id = COALESCE($6, queue_job_id), \
             retry_count = $7, \
             queued_at = $8, \
             started_at = $9, \
             completed_at = $10, \
             duration_ms = $11, \
             updated_at = $12 \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .bind(update.status)
    .bind(&update.output_data)
    .bind(&update.error_data)
    .bind(&update.metadata)
    .bind(&update.queue_job_id)
    .bind(update.retry_count)
    .bind(update.queued_at)
    .bind(update.started_at)
    .bind(update.completed_at)
    .bind(update.duration_ms)
    .bind(update.updated_at)
    .fetch_one(conn)
    .await
    .context("failed to update task")?;

    Ok(task)
}

fn push_task_filters(
    qb: &mut QueryBuilder<'_, Postgres>,
    run_id: Option<Uuid>,
    status: Option<TaskStatus>,
) {
    let mut has_where = false;
    if let Some(run_id) = run_id {
        qb.push(" WHERE run_id = ").push_bind(run_id);
        has_where = true;
    }
    if let Some(status) = status {
        qb.push(if has_where { " AND " } else { " WHERE " });
        qb.push("status = ").push_bind(status);
    }
}

/// Count visible tasks under optional run and status filters.
pub async fn count_tasks(
    conn: &mut PgConnection,
    run_id: Option<Uuid>,
    status: Option<TaskStatus>,
) -> Result<i64> {
    let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM tasks");
    push_task_filters(&mut qb, run_id, status);

    let count: i64 = qb
        .build_query_scalar()
        .fetch_one(conn)
        .await
        .context("failed to count tasks")?;

    Ok(count)
}

/// List visible tasks under optional run and status filters.
///
/// The sort column comes from [`TaskSortBy::column`], never from user input.
pub async fn list_tasks(
    conn: &mut PgConnection,
    run_id: Option<Uuid>,
    status: Option<TaskStatus>,
    sort_by: TaskSortBy,
    sort_order: SortOrder,
    limit: i64,
    offset: i64,
) -> Result<Vec<Task>> {
    let mut qb = QueryBuilder::new("SELECT * FROM tasks");
    push_task_filters(&mut qb, run_id, status);
    qb.push(" ORDER BY ")
        .push(sort_by.column())
        .push(" ")
        .push(sort_order.sql())
        .push(", id ")
        .push(sort_order.sql());
    qb.push(" LIMIT ").push_bind(limit);
    qb.push(" OFFSET ").push_bind(offset);

    let tasks = qb
        .build_query_as::<Task>()
        .fetch_all(conn)
        .await
        .context("failed to list tasks")?;

    Ok(tasks)
}
