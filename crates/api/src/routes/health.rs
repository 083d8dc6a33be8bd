use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;

use crate::AppState;

pub fn health_router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz))
}

/// Unauthenticated liveness probe, distinct from the authenticated
/// `GET /health` snapshot served from `api_router`. Used by deploy checks
/// and ops scripts that don't carry the dashboard token.
async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let report = state.strategies.read().await;
    let status = if report.invalid_enabled.is_empty() { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "strategies_loaded": report.strategies.len(),
        "scan_enabled": state.scan_enabled.load(Ordering::SeqCst),
    }))
}
