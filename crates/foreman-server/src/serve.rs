//! Router assembly and the `foreman serve` entry point.

use std::net::SocketAddr;

use anyhow::Result;
use axum::routing::{get, patch, post};
use axum::{Router, middleware};
use tower_http::cors::CorsLayer;

use crate::auth;
use crate::routes;
use crate::state::AppState;

/// Assemble the full application router.
///
/// `/health` is open; everything under `/api/v1` requires a bearer token,
/// and the tenant resources additionally require an `x-org-id` header.
pub fn build_router(state: AppState) -> Router {
    let tenant_api = Router::new()
        .route("/runs", post(routes::runs::create).get(routes::runs::list))
        .route(
            "/runs/{run_id}",
            get(routes::runs::get).patch(routes::runs::update),
        )
        .route(
            "/runs/{run_id}/data",
            post(routes::run_data::create)
                .get(routes::run_data::query)
                .delete(routes::run_data::delete),
        )
        .route(
            "/runs/{run_id}/data/{data_id}/tags",
            patch(routes::run_data::update_tags),
        )
        .route("/tasks", post(routes::tasks::create).get(routes::tasks::list))
        .route(
            "/tasks/{task_id}",
            get(routes::tasks::get).patch(routes::tasks::update),
        )
        .layer(middleware::from_fn(auth::require_org));

    let config_api = Router::new()
        .route("/config", get(routes::config::get_config))
        .route("/config/redis", get(routes::config::get_redis))
        .route("/config/queues", get(routes::config::get_queues));

    let api = Router::new()
        .merge(tenant_api)
        .merge(config_api)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .route("/health", get(routes::health::health))
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until Ctrl+C.
pub async fn run_serve(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    tracing::info!("foreman listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("foreman shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    use foreman_db::Db;
    use foreman_db::config::DbConfig;
    use foreman_test_utils::create_test_db;

    use crate::config::ServerConfig;
    use crate::state::AppState;

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    fn test_state(db: Db) -> AppState {
        let config = ServerConfig {
            db: DbConfig::new("postgresql://unused/unused"),
            redis_url: "redis://localhost:6379".to_owned(),
            tasks_queue: "foreman:tasks".to_owned(),
            results_queue: "foreman:results".to_owned(),
            port: 0,
            environment: "test".to_owned(),
            auth_token: None,
        };
        AppState::new(db, config)
    }

    async fn send(
        db: Db,
        method: Method,
        uri: &str,
        org: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> axum::response::Response {
        let app = super::build_router(test_state(db));
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", "Bearer test-token");
        if let Some(org) = org {
            builder = builder.header("x-org-id", org);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.oneshot(request).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_health_requires_no_auth() {
        let tdb = create_test_db().await;

        let app = super::build_router(test_state(tdb.db.clone()));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["services"]["database"], "up");

        tdb.done().await;
    }

    #[tokio::test]
    async fn test_missing_bearer_is_unauthorized() {
        let tdb = create_test_db().await;

        let app = super::build_router(test_state(tdb.db.clone()));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/runs")
                    .header("x-org-id", "org-a")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(resp).await;
        assert!(json.get("error").is_some());

        tdb.done().await;
    }

    #[tokio::test]
    async fn test_missing_org_header_is_unauthorized() {
        let tdb = create_test_db().await;

        let resp = send(tdb.db.clone(), Method::GET, "/api/v1/runs", None, None).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        tdb.done().await;
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let tdb = create_test_db().await;

        let resp = send(
            tdb.db.clone(),
            Method::POST,
            "/api/v1/runs",
            Some("org-a"),
            Some(serde_json::json!({"inputData": {"a": 1}})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert_eq!(created["status"], "pending");
        assert_eq!(created["orgId"], "org-a");
        assert_eq!(created["inputData"]["a"], 1);
        assert_eq!(created["totalTasks"], 0);

        let id = created["id"].as_str().unwrap().to_owned();
        let resp = send(
            tdb.db.clone(),
            Method::GET,
            &format!("/api/v1/runs/{id}"),
            Some("org-a"),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let fetched = body_json(resp).await;
        assert_eq!(fetched["id"], id.as_str());

        tdb.done().await;
    }

    #[tokio::test]
    async fn test_get_run_not_found() {
        let tdb = create_test_db().await;

        let random_id = uuid::Uuid::new_v4();
        let resp = send(
            tdb.db.clone(),
            Method::GET,
            &format!("/api/v1/runs/{random_id}"),
            Some("org-a"),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        tdb.done().await;
    }

    #[tokio::test]
    async fn test_cross_tenant_run_is_invisible() {
        let tdb = create_test_db().await;

        let resp = send(
            tdb.db.clone(),
            Method::POST,
            "/api/v1/runs",
            Some("org-a"),
            Some(serde_json::json!({"inputData": {}})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let run = body_json(resp).await;
        let id = run["id"].as_str().unwrap().to_owned();

        // Org B cannot see it, directly or in listings.
        let resp = send(
            tdb.db.clone(),
            Method::GET,
            &format!("/api/v1/runs/{id}"),
            Some("org-b"),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(tdb.db.clone(), Method::GET, "/api/v1/runs", Some("org-b"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let listing = body_json(resp).await;
        assert_eq!(listing["pagination"]["total"], 0);
        assert_eq!(listing["data"], serde_json::json!([]));

        tdb.done().await;
    }

    #[tokio::test]
    async fn test_list_runs_envelope() {
        let tdb = create_test_db().await;

        for i in 0..3 {
            let resp = send(
                tdb.db.clone(),
                Method::POST,
                "/api/v1/runs",
                Some("org-a"),
                Some(serde_json::json!({"inputData": {"n": i}})),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::CREATED);
        }

        let resp = send(
            tdb.db.clone(),
            Method::GET,
            "/api/v1/runs?limit=2&offset=0",
            Some("org-a"),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"].as_array().unwrap().len(), 2);
        assert_eq!(json["pagination"]["total"], 3);
        assert_eq!(json["pagination"]["limit"], 2);
        assert_eq!(json["pagination"]["offset"], 0);

        // Out-of-range limit is a validation error.
        let resp = send(
            tdb.db.clone(),
            Method::GET,
            "/api/v1/runs?limit=101",
            Some("org-a"),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        tdb.done().await;
    }

    #[tokio::test]
    async fn test_invalid_transition_is_bad_request() {
        let tdb = create_test_db().await;

        let resp = send(
            tdb.db.clone(),
            Method::POST,
            "/api/v1/runs",
            Some("org-a"),
            Some(serde_json::json!({"inputData": {}})),
        )
        .await;
        let run = body_json(resp).await;
        let id = run["id"].as_str().unwrap().to_owned();

        let resp = send(
            tdb.db.clone(),
            Method::PATCH,
            &format!("/api/v1/runs/{id}"),
            Some("org-a"),
            Some(serde_json::json!({"status": "completed"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(
            tdb.db.clone(),
            Method::PATCH,
            &format!("/api/v1/runs/{id}"),
            Some("org-a"),
            Some(serde_json::json!({"status": "running"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert!(
            json["error"].as_str().unwrap().contains("invalid transition"),
            "error should name the transition failure: {json}"
        );

        tdb.done().await;
    }

    #[tokio::test]
    async fn test_task_creation_bumps_run_counters() {
        let tdb = create_test_db().await;

        let resp = send(
            tdb.db.clone(),
            Method::POST,
            "/api/v1/runs",
            Some("org-a"),
            Some(serde_json::json!({"inputData": {}})),
        )
        .await;
        let run = body_json(resp).await;
        let run_id = run["id"].as_str().unwrap().to_owned();

        let resp = send(
            tdb.db.clone(),
            Method::POST,
            "/api/v1/tasks",
            Some("org-a"),
            Some(serde_json::json!({
                "runId": run_id,
                "type": "echo",
                "inputData": {"x": 1},
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let task = body_json(resp).await;
        assert_eq!(task["type"], "echo");
        assert_eq!(task["status"], "pending");
        assert_eq!(task["maxRetries"], 3);

        let resp = send(
            tdb.db.clone(),
            Method::GET,
            &format!("/api/v1/runs/{run_id}"),
            Some("org-a"),
            None,
        )
        .await;
        let run = body_json(resp).await;
        assert_eq!(run["totalTasks"], 1);

        tdb.done().await;
    }

    #[tokio::test]
    async fn test_task_create_for_missing_run_is_not_found() {
        let tdb = create_test_db().await;

        let resp = send(
            tdb.db.clone(),
            Method::POST,
            "/api/v1/tasks",
            Some("org-a"),
            Some(serde_json::json!({
                "runId": uuid::Uuid::new_v4(),
                "type": "echo",
                "inputData": {},
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        tdb.done().await;
    }

    #[tokio::test]
    async fn test_run_data_create_query_delete() {
        let tdb = create_test_db().await;

        let resp = send(
            tdb.db.clone(),
            Method::POST,
            "/api/v1/runs",
            Some("org-a"),
            Some(serde_json::json!({"inputData": {}})),
        )
        .await;
        let run = body_json(resp).await;
        let run_id = run["id"].as_str().unwrap().to_owned();

        let resp = send(
            tdb.db.clone(),
            Method::POST,
            "/api/v1/tasks",
            Some("org-a"),
            Some(serde_json::json!({"runId": run_id, "type": "t", "inputData": {}})),
        )
        .await;
        let task = body_json(resp).await;
        let task_id = task["id"].as_str().unwrap().to_owned();

        let resp = send(
            tdb.db.clone(),
            Method::POST,
            &format!("/api/v1/runs/{run_id}/data"),
            Some("org-a"),
            Some(serde_json::json!({
                "taskId": task_id,
                "key": "sensor.temp.in",
                "value": {"celsius": 21},
                "tags": ["building-a"],
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let data = body_json(resp).await;
        assert_eq!(data["key"], "sensor.temp.in");
        assert_eq!(data["tags"], serde_json::json!(["building-a"]));

        let resp = send(
            tdb.db.clone(),
            Method::GET,
            &format!("/api/v1/runs/{run_id}/data?keyStartsWith=sensor.temp"),
            Some("org-a"),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"].as_array().unwrap().len(), 1);
        assert_eq!(json["pagination"]["total"], 1);

        // Both selectors at once is a validation error.
        let resp = send(
            tdb.db.clone(),
            Method::DELETE,
            &format!(
                "/api/v1/runs/{run_id}/data?key=sensor.temp.in&id={}",
                data["id"].as_str().unwrap()
            ),
            Some("org-a"),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(
            tdb.db.clone(),
            Method::DELETE,
            &format!("/api/v1/runs/{run_id}/data?key=sensor.temp.in"),
            Some("org-a"),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["deleted"], 1);

        // Deleting again matches nothing.
        let resp = send(
            tdb.db.clone(),
            Method::DELETE,
            &format!("/api/v1/runs/{run_id}/data?key=sensor.temp.in"),
            Some("org-a"),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        tdb.done().await;
    }

    #[tokio::test]
    async fn test_config_endpoints_require_only_bearer() {
        let tdb = create_test_db().await;

        let resp = send(tdb.db.clone(), Method::GET, "/api/v1/config", None, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["queues"]["tasks"], "foreman:tasks");
        assert_eq!(json["redis"]["host"], "localhost");

        let resp = send(tdb.db.clone(), Method::GET, "/api/v1/config/queues", None, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["results"], "foreman:results");

        tdb.done().await;
    }
}
