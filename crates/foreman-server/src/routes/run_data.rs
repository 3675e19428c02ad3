use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use foreman_core::run_data::{self, CreateRunData, DeleteRunData, QueryRunData, UpdateTags};
use foreman_db::TenantContext;
use foreman_db::models::{RunData, SortOrder};
use foreman_db::queries::run_data::{RunDataSortBy, TagMode};

use crate::error::ApiError;
use crate::routes::{ListResponse, split_csv};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunDataBody {
    pub task_id: Uuid,
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// List-valued filters arrive as comma-separated query values
/// (`?tags=a,b&tagMode=all`).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunDataQueryParams {
    pub key: Option<String>,
    pub keys: Option<String>,
    pub key_starts_with: Option<String>,
    pub key_pattern: Option<String>,
    pub tags: Option<String>,
    pub tag_starts_with: Option<String>,
    pub tag_mode: Option<TagMode>,
    pub include_all: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sort_by: Option<RunDataSortBy>,
    pub sort_order: Option<SortOrder>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateTagsBody {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteQuery {
    pub key: Option<String>,
    pub id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: u64,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(run_id): Path<Uuid>,
    Json(body): Json<CreateRunDataBody>,
) -> Result<(StatusCode, Json<RunData>), ApiError> {
    let data = run_data::create_run_data(
        &state.db,
        &ctx,
        CreateRunData {
            run_id,
            task_id: body.task_id,
            key: body.key,
            value: body.value,
            tags: body.tags,
            metadata: body.metadata,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(data)))
}

pub async fn query(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(run_id): Path<Uuid>,
    Query(params): Query<RunDataQueryParams>,
) -> Result<Json<ListResponse<RunData>>, ApiError> {
    let defaults = QueryRunData::default();
    let query = QueryRunData {
        key: params.key,
        keys: split_csv(params.keys),
        key_starts_with: split_csv(params.key_starts_with),
        key_pattern: params.key_pattern,
        tags: split_csv(params.tags),
        tag_starts_with: split_csv(params.tag_starts_with),
        tag_mode: params.tag_mode.unwrap_or(defaults.tag_mode),
        include_all: params.include_all.unwrap_or(defaults.include_all),
        limit: params.limit.unwrap_or(defaults.limit),
        offset: params.offset.unwrap_or(defaults.offset),
        sort_by: params.sort_by.unwrap_or(defaults.sort_by),
        sort_order: params.sort_order.unwrap_or(defaults.sort_order),
    };
    let page = run_data::query_run_data(&state.db, &ctx, run_id, query).await?;
    Ok(Json(page.into()))
}

pub async fn update_tags(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path((_run_id, data_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<UpdateTagsBody>,
) -> Result<Json<RunData>, ApiError> {
    let data = run_data::update_run_data_tags(
        &state.db,
        &ctx,
        data_id,
        UpdateTags {
            add: body.add,
            remove: body.remove,
        },
    )
    .await?;
    Ok(Json(data))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = run_data::delete_run_data(
        &state.db,
        &ctx,
        run_id,
        DeleteRunData {
            key: query.key,
            id: query.id,
        },
    )
    .await?;
    Ok(Json(DeleteResponse { deleted }))
}
