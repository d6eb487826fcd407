use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::AppState;

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "railway-core",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn get_detection_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.scheduler.status()))
}

pub async fn start_detection(State(state): State<AppState>) -> Json<Value> {
    state.scheduler.clone().start();
    Json(json!({"is_running": state.scheduler.is_running()}))
}

pub async fn stop_detection(State(state): State<AppState>) -> Json<Value> {
    state.scheduler.stop().await;
    Json(json!({"is_running": state.scheduler.is_running()}))
}

pub async fn run_detection_once(State(state): State<AppState>) -> Json<Value> {
    let result = state.scheduler.run_once().await;
    Json(json!(result))
}

#[derive(Debug, Deserialize)]
pub struct IntervalRequest {
    pub seconds: u64,
}

pub async fn set_detection_interval(
    State(state): State<AppState>,
    Json(request): Json<IntervalRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.scheduler.set_interval(request.seconds) {
        Ok(()) => Ok(Json(json!({"detection_interval_seconds": request.seconds}))),
        Err(e) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": e.to_string()})),
        )),
    }
}

pub async fn force_cache_refresh(State(state): State<AppState>) -> Json<Value> {
    state.cache.force_refresh().await;
    Json(json!({"status": "cache invalidated"}))
}

pub async fn get_connection_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.hub.connection_stats()))
}
