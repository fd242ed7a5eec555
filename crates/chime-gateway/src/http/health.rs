use axum::{extract::State, Json};
use chime_scheduler::CoordinatorHealth;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health — liveness check with this node's view of the cluster lock.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let lock = state.engine.health();
    let status = match lock {
        CoordinatorHealth::Healthy => "ok",
        CoordinatorHealth::Degraded { .. } => "degraded",
    };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("CHIME_GIT_SHA"),
        "instance_id": state.instance_id,
        "dispatching": state.engine.is_running(),
        "lock": lock,
    }))
}
