use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use foreman_core::tasks::{self, CreateTask, ListTasks, UpdateTask};
use foreman_db::TenantContext;
use foreman_db::models::{SortOrder, Task, TaskStatus};
use foreman_db::queries::tasks::TaskSortBy;

use crate::error::ApiError;
use crate::routes::ListResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskBody {
    pub run_id: Uuid,
    #[serde(default)]
    pub parent_task_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub task_type: String,
    pub input_data: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateTaskBody {
    pub status: Option<TaskStatus>,
    pub output_data: Option<Value>,
    pub error_data: Option<Value>,
    pub metadata: Option<Value>,
    pub queue_job_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListTasksQuery {
    pub run_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sort_by: Option<TaskSortBy>,
    pub sort_order: Option<SortOrder>,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(body): Json<CreateTaskBody>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = tasks::create_task(
        &state.db,
        &ctx,
        CreateTask {
            run_id: body.run_id,
            parent_task_id: body.parent_task_id,
            task_type: body.task_type,
            input_data: body.input_data,
            metadata: body.metadata,
            max_retries: body.max_retries,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    let task = tasks::get_task(&state.db, &ctx, task_id).await?;
    Ok(Json(task))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(task_id): Path<Uuid>,
    Json(body): Json<UpdateTaskBody>,
) -> Result<Json<Task>, ApiError> {
    let task = tasks::update_task(
        &state.db,
        &ctx,
        task_id,
        UpdateTask {
            status: body.status,
            output_data: body.output_data,
            error_data: body.error_data,
            metadata: body.metadata,
            queue_job_id: body.queue_job_id,
        },
    )
    .await?;
    Ok(Json(task))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<ListResponse<Task>>, ApiError> {
    let defaults = ListTasks::default();
    let params = ListTasks {
        run_id: query.run_id,
        status: query.status,
        limit: query.limit.unwrap_or(defaults.limit),
        offset: query.offset.unwrap_or(defaults.offset),
        sort_by: query.sort_by.unwrap_or(defaults.sort_by),
        sort_order: query.sort_order.unwrap_or(defaults.sort_order),
    };
    let page = tasks::list_tasks(&state.db, &ctx, params).await?;
    Ok(Json(page.into()))
}
