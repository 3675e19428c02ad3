use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use foreman_db::now_millis;

use crate::state::AppState;

/// Liveness probe: 200 when the database answers, 503 otherwise.
///
/// This endpoint requires no authentication.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_up = sqlx::query("SELECT 1")
        .execute(state.db.root_pool())
        .await
        .is_ok();

    let status = if db_up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if db_up { "ok" } else { "degraded" },
        "timestamp": now_millis(),
        "environment": state.config.environment,
        "services": {
            "database": if db_up { "up" } else { "down" },
        },
    });

    (status, Json(body))
}
