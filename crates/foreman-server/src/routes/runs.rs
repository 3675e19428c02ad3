use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use foreman_core::runs::{self, CreateRun, ListRuns, UpdateRun};
use foreman_db::TenantContext;
use foreman_db::models::{Run, RunStatus, SortOrder};
use foreman_db::queries::runs::RunSortBy;

use crate::error::ApiError;
use crate::routes::ListResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunBody {
    pub input_data: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateRunBody {
    pub status: Option<RunStatus>,
    pub output_data: Option<Value>,
    pub error_data: Option<Value>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListRunsQuery {
    pub status: Option<RunStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sort_by: Option<RunSortBy>,
    pub sort_order: Option<SortOrder>,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(body): Json<CreateRunBody>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    let run = runs::create_run(
        &state.db,
        &ctx,
        CreateRun {
            input_data: body.input_data,
            metadata: body.metadata,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Run>, ApiError> {
    let run = runs::get_run(&state.db, &ctx, run_id).await?;
    Ok(Json(run))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(run_id): Path<Uuid>,
    Json(body): Json<UpdateRunBody>,
) -> Result<Json<Run>, ApiError> {
    let run = runs::update_run(
        &state.db,
        &ctx,
        run_id,
        UpdateRun {
            status: body.status,
            output_data: body.output_data,
            error_data: body.error_data,
            metadata: body.metadata,
        },
    )
    .await?;
    Ok(Json(run))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ListResponse<Run>>, ApiError> {
    let defaults = ListRuns::default();
    let params = ListRuns {
        status: query.status,
        limit: query.limit.unwrap_or(defaults.limit),
        offset: query.offset.unwrap_or(defaults.offset),
        sort_by: query.sort_by.unwrap_or(defaults.sort_by),
        sort_order: query.sort_order.unwrap_or(defaults.sort_order),
    };
    let page = runs::list_runs(&state.db, &ctx, params).await?;
    Ok(Json(page.into()))
}
