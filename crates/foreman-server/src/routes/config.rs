//! Broker-coordinate endpoints.
//!
//! Workers and orchestrators enqueue jobs against the broker directly; these
//! endpoints tell authenticated clients where the broker lives and which
//! queues to use. Clients may cache the response briefly (a few minutes).

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::config::RedisCoordinates;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct QueuesConfig {
    pub tasks: String,
    pub results: String,
}

#[derive(Debug, Serialize)]
pub struct FullConfig {
    pub redis: RedisCoordinates,
    pub queues: QueuesConfig,
}

fn queues(state: &AppState) -> QueuesConfig {
    QueuesConfig {
        tasks: state.config.tasks_queue.clone(),
        results: state.config.results_queue.clone(),
    }
}

pub async fn get_config(State(state): State<AppState>) -> Json<FullConfig> {
    Json(FullConfig {
        redis: state.config.redis_coordinates(),
        queues: queues(&state),
    })
}

pub async fn get_redis(State(state): State<AppState>) -> Json<RedisCoordinates> {
    Json(state.config.redis_coordinates())
}

pub async fn get_queues(State(state): State<AppState>) -> Json<QueuesConfig> {
    Json(queues(&state))
}
