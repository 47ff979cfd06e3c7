use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::server::AppState;

/// Liveness probe: returns 200 OK if the server process is running.
pub async fn health_check() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Readiness probe: the coordination backend must answer, and this node
/// must appear in its own membership view.
pub async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if let Err(e) = state.coordination.list_prefix("__healthcheck__").await {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "coordination_connected": false, "error": e.to_string()})),
        ));
    }
    let view = state.membership.view();
    let joined = view.position(state.membership.node_id()).is_some();
    let body = json!({
        "status": if joined { "ready" } else { "not_ready" },
        "coordination_connected": true,
        "cluster_members": view.len(),
        "templates": state.store.size(),
        "loading": state.loader.is_running(),
    });
    if joined {
        Ok(Json(body))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(body)))
    }
}
