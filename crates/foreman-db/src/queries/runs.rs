//! Database query functions for the `runs` table.
//!
//! These run inside a caller-provided (tenant-scoped) transaction; the
//! row-level policies decide visibility, so none of the SQL here filters on
//! `org_id` itself.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::models::{now_millis, Run, RunStatus, SortOrder};

/// Sort key for run listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSortBy {
    CreatedAt,
    StartedAt,
    CompletedAt,
}

impl RunSortBy {
    /// The column this key sorts on.
    pub fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::StartedAt => "started_at",
            Self::CompletedAt => "completed_at",
        }
    }
}

impl fmt::Display for RunSortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for RunSortBy {
    type Err = RunSortByParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(Self::CreatedAt),
            "started_at" => Ok(Self::StartedAt),
            "completed_at" => Ok(Self::CompletedAt),
            other => Err(RunSortByParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunSortBy`] string.
#[derive(Debug, Clone)]
pub struct RunSortByParseError(pub String);

impl fmt::Display for RunSortByParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run sort key: {:?}", self.0)
    }
}

impl std::error::Error for RunSortByParseError {}

/// Parameters for inserting a new run row.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub org_id: String,
    pub input_data: Value,
    pub metadata: Option<Value>,
}

/// Insert a new run row with a fresh id, `pending` status, zeroed counters,
/// and `created_at = updated_at = now`.
pub async fn insert_run(conn: &mut PgConnection, new: &NewRun) -> Result<Run> {
    let now = now_millis();
    let run = sqlx::query_as::<_, Run>(
        "INSERT INTO runs (id, org_id, status, input_data, metadata, created_at, updated_at) \
         VALUES ($1, $2, 'pending', $3, $4, $5, $5) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(&new.org_id)
    .bind(&new.input_data)
    .bind(&new.metadata)
    .bind(now)
    .fetch_one(conn)
    .await
    .context("failed to insert run")?;

    Ok(run)
}

/// Fetch a single run by id.
pub async fn get_run(conn: &mut PgConnection, id: Uuid) -> Result<Option<Run>> {
    let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await
        .context("failed to fetch run")?;

    Ok(run)
}

/// Fetch a run and take a row lock for the remainder of the transaction.
pub async fn get_run_for_update(conn: &mut PgConnection, id: Uuid) -> Result<Option<Run>> {
    let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await
        .context("failed to lock run")?;

    Ok(run)
}

/// Final column values for a run update, computed by the caller from the
/// transition rules.
#[derive(Debug, Clone)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub output_data: Option<Value>,
    pub error_data: Option<Value>,
    pub metadata: Option<Value>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub updated_at: i64,
}

/// Write a run update. Payload fields keep their current value when the
/// patch leaves them unset.
pub async fn update_run_row(conn: &mut PgConnection, id: Uuid, update: &RunUpdate) -> Result<Run> {
    let run = sqlx::query_as::<_, Run>(
        "UPDATE runs \
         SET status = $2, \
             output_data = COALESCE($3, output_data), \
             error_data = COALESCE($4, error_data), \
             metadata = COALESCE($5, metadata), \
             started_at = $6, \
             completed_at = $7, \
             duration_ms = $8, \
             updated_at = $9 \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .bind(update.status)
    .bind(&update.output_data)
    .bind(&update.error_data)
    .bind(&update.metadata)
    .bind(update.started_at)
    .bind(update.completed_at)
    .bind(update.duration_ms)
    .bind(update.updated_at)
    .fetch_one(conn)
    .await
    .context("failed to update run")?;

    Ok(run)
}

/// Increment `total_tasks` on a run, bumping `updated_at`. Returns the
/// number of rows affected (0 when the run is not visible).
pub async fn increment_total_tasks(conn: &mut PgConnection, run_id: Uuid, now: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs SET total_tasks = total_tasks + 1, updated_at = $2 WHERE id = $1",
    )
    .bind(run_id)
    .bind(now)
    .execute(conn)
    .await
    .context("failed to increment total_tasks")?;

    Ok(result.rows_affected())
}

/// Apply terminal-task counter deltas to a run, bumping `updated_at`.
pub async fn apply_task_counters(
    conn: &mut PgConnection,
    run_id: Uuid,
    completed_delta: i32,
    failed_delta: i32,
    now: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs \
         SET completed_tasks = completed_tasks + $2, \
             failed_tasks = failed_tasks + $3, \
             updated_at = $4 \
         WHERE id = $1",
    )
    .bind(run_id)
    .bind(completed_delta)
    .bind(failed_delta)
    .bind(now)
    .execute(conn)
    .await
    .context("failed to apply task counters")?;

    Ok(result.rows_affected())
}

/// Count visible runs under an optional status filter.
pub async fn count_runs(conn: &mut PgConnection, status: Option<RunStatus>) -> Result<i64> {
    let count: i64 = match status {
        Some(status) => sqlx::query_scalar("SELECT COUNT(*) FROM runs WHERE status = $1")
            .bind(status)
            .fetch_one(conn)
            .await,
        None => sqlx::query_scalar("SELECT COUNT(*) FROM runs").fetch_one(conn).await,
    }
    .context("failed to count runs")?;

    Ok(count)
}

/// List visible runs under an optional status filter.
///
/// The sort column comes from [`RunSortBy::column`], never from user input,
/// so formatting it into the SQL is safe.
pub async fn list_runs(
    conn: &mut PgConnection,
    status: Option<RunStatus>,
    sort_by: RunSortBy,
    sort_order: SortOrder,
    limit: i64,
    offset: i64,
) -> Result<Vec<Run>> {
    let order = format!("{} {}, id {}", sort_by.column(), sort_order.sql(), sort_order.sql());
    let runs = match status {
        Some(status) => {
            let sql = format!(
                "SELECT * FROM runs WHERE status = $1 ORDER BY {order} LIMIT $2 OFFSET $3"
            );
            sqlx::query_as::<_, Run>(&sql)
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(conn)
                .await
        }
        None => {
            let sql = format!("SELECT * FROM runs ORDER BY {order} LIMIT $1 OFFSET $2");
            sqlx::query_as::<_, Run>(&sql)
                .bind(limit)
                .bind(offset)
                .fetch_all(conn)
                .await
        }
    }
    .context("failed to list runs")?;

    Ok(runs)
}
