//! Test-support endpoints for exercising engine lifecycle from the outside.
//!
//! - `POST /api/test/destroy-session/{id}` — hard destroy
//! - `POST /api/test/restart-engine`       — graceful stop + fresh reconcile

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::AppState;

/// `POST /api/test/destroy-session/{id}` — terminal destroy including on-disk
/// state.
pub async fn destroy_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state.engine.destroy(&id, true).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e, "code": "DESTROY_FAILED"})),
        )
    })?;
    Ok(Json(json!({ "ok": true, "session_id": id })))
}

/// `POST /api/test/restart-engine` — close all writers and watchers, then
/// reconcile against the surviving multiplexer sessions.
pub async fn restart_engine(State(state): State<AppState>) -> Json<Value> {
    state.engine.stop().await;
    state.engine.reconcile().await;
    Json(json!({ "ok": true }))
}
