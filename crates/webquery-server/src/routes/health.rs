//! Health, readiness and runtime stats.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(get_health))
        .route("/ready", get(get_ready))
        .route("/stats", get(get_stats))
}

/// GET /api/health: liveness plus a reachability check of the browser
/// infrastructure. Keys are snake_case like the infrastructure's own health.
async fn get_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let reachable = state.browser.ping().await;
    Json(serde_json::json!({
        "status": "healthy",
        "service": "webquery",
        "version": env!("CARGO_PKG_VERSION"),
        "infrastructure_reachable": reachable,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /api/ready: 503 until queries can actually be served.
async fn get_ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pool = state.pool().stats();
    let pool_ready = pool.capacity > 0 && pool.unhealthy < pool.capacity;
    let model_ready = state.orchestrator.dispatcher().has_backends();
    let ready = pool_ready && model_ready;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "ready": ready,
            "pool": pool_ready,
            "models": model_ready,
        })),
    )
}

/// GET /api/stats: pool, dispatcher and cache counters.
async fn get_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let llm = state.llm_config.read().to_response();
    Json(serde_json::json!({
        "pool": state.pool().stats(),
        "models": state.orchestrator.dispatcher().stats(),
        "cache": state.orchestrator.cache().stats(),
        "llm": llm,
        "limits": {
            "sessionPoolSize": state.config.orchestration.session_pool_size,
            "modelConcurrencyLimit": state.config.orchestration.model_concurrency_limit,
            "planDeadlineMs": state.config.orchestration.plan_deadline_ms,
            "perCallTimeoutMs": state.config.orchestration.per_call_timeout_ms,
        },
    }))
}
