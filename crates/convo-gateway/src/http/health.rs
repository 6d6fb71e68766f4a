use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// `GET /health` — liveness probe. No provider health-check loop ships in
/// the core (§1 non-goal); this reports process-local state instead: the
/// configured default model and the number of sessions with an active call.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "default_model": state.default_model(),
        "active_calls": state.registry.active_count(),
    }))
}
