//! Run manager: lifecycle of top-level workflow executions.

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use foreman_db::models::{now_millis, Run, RunStatus, SortOrder};
use foreman_db::queries::runs::{self, NewRun, RunSortBy, RunUpdate};
use foreman_db::{Db, TenantContext};

use crate::error::Error;
use crate::page::{validate_page, Page};

/// Maximum page size for run listings.
pub const MAX_LIST_LIMIT: i64 = 100;

/// Request to create a run.
#[derive(Debug, Clone)]
pub struct CreateRun {
    pub input_data: Value,
    pub metadata: Option<Value>,
}

/// Patch for an existing run. Unset fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct UpdateRun {
    pub status: Option<RunStatus>,
    pub output_data: Option<Value>,
    pub error_data: Option<Value>,
    pub metadata: Option<Value>,
}

/// Listing parameters for runs.
#[derive(Debug, Clone)]
pub struct ListRuns {
    pub status: Option<RunStatus>,
    pub limit: i64,
    pub offset: i64,
    pub sort_by: RunSortBy,
    pub sort_order: SortOrder,
}

impl Default for ListRuns {
    fn default() -> Self {
        Self {
            status: None,
            limit: 20,
            offset: 0,
            sort_by: RunSortBy::CreatedAt,
            sort_order: SortOrder::Desc,
        }
    }
}

/// Create a run with `pending` status and zeroed counters.
pub async fn create_run(db: &Db, ctx: &TenantContext, req: CreateRun) -> Result<Run, Error> {
    let org_id = ctx
        .org_id()
        .ok_or_else(|| Error::Forbidden("run creation requires an organization context".into()))?;
    if req.input_data.is_null() {
        return Err(Error::InvalidInput("inputData is required".into()));
    }

    let new = NewRun {
        org_id: org_id.to_owned(),
        input_data: req.input_data,
        metadata: req.metadata,
    };

    let mut tx = ctx.begin(db).await?;
    let run = runs::insert_run(&mut tx, &new).await?;
    tx.commit().await.context("failed to commit run creation")?;

    info!(run_id = %run.id, org = %org_id, "run created");
    Ok(run)
}

/// Fetch a run visible under the context.
pub async fn get_run(db: &Db, ctx: &TenantContext, id: Uuid) -> Result<Run, Error> {
    let mut tx = ctx.begin(db).await?;
    let run = runs::get_run(&mut tx, id)
        .await?
        .ok_or_else(|| Error::not_found("run", id))?;
    tx.commit().await.context("failed to commit run fetch")?;
    Ok(run)
}

/// Apply a patch to a run, enforcing the status transition rules.
///
/// Terminal statuses are absorbing: a patch that would move a terminal run
/// to a different status is rejected without touching the row.
pub async fn update_run(
    db: &Db,
    ctx: &TenantContext,
    id: Uuid,
    patch: UpdateRun,
) -> Result<Run, Error> {
    let mut tx = ctx.begin(db).await?;
    let current = runs::get_run_for_update(&mut tx, id)
        .await?
        .ok_or_else(|| Error::not_found("run", id))?;

    let now = now_millis();
    let mut started_at = current.started_at;
    let mut completed_at = current.completed_at;
    let mut duration_ms = current.duration_ms;

    let status = match patch.status {
        Some(next) => {
            if current.status.is_terminal() && next != current.status {
                return Err(Error::InvalidTransition(format!(
                    "run {id} is {}; cannot transition to {next}",
                    current.status
                )));
            }
            if next == RunStatus::Running && started_at.is_none() {
                started_at = Some(now);
            }
            if next.is_terminal() && completed_at.is_none() {
                completed_at = Some(now);
                duration_ms = Some(now - started_at.unwrap_or(current.created_at));
            }
            next
        }
        None => current.status,
    };

    let update = RunUpdate {
        status,
        output_data: patch.output_data,
        error_data: patch.error_data,
        metadata: patch.metadata,
        started_at,
        completed_at,
        duration_ms,
        updated_at: now,
    };

    let run = runs::update_run_row(&mut tx, id, &update).await?;
    tx.commit().await.context("failed to commit run update")?;

    debug!(run_id = %id, status = %run.status, "run updated");
    Ok(run)
}

/// List runs visible under the context.
pub async fn list_runs(db: &Db, ctx: &TenantContext, params: ListRuns) -> Result<Page<Run>, Error> {
    validate_page(params.limit, params.offset, MAX_LIST_LIMIT)?;

    let mut tx = ctx.begin(db).await?;
    let total = runs::count_runs(&mut tx, params.status).await?;
    let items = runs::list_runs(
        &mut tx,
        params.status,
        params.sort_by,
        params.sort_order,
        params.limit,
        params.offset,
    )
    .await?;
    tx.commit().await.context("failed to commit run listing")?;

    Ok(Page {
        items,
        total,
        limit: params.limit,
        offset: params.offset,
    })
}
