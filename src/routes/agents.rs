//! REST endpoints for session management.
//!
//! - `GET    /api/agents`      — list all session summaries
//! - `POST   /api/agents`      — create (or resume) a session
//! - `DELETE /api/agents/{id}` — interrupt the in-flight turn

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::AppState;

/// `GET /api/agents` — list all sessions known on disk, live status overlaid.
pub async fn list_agents(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.engine.list_sessions().await;
    Json(json!({ "agents": sessions }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentRequest {
    pub project_path: String,
    pub resume_session_id: Option<String>,
    pub model: Option<String>,
}

/// `POST /api/agents` — create a session (optionally resuming a remote
/// assistant session) and wake its supervisor harness.
pub async fn create_agent(
    State(state): State<AppState>,
    Json(payload): Json<CreateAgentRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if payload.project_path.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "projectPath is required", "code": "MISSING_FIELD"})),
        ));
    }

    let id = Uuid::new_v4().to_string();
    let summary = state
        .engine
        .create(
            &id,
            &payload.project_path,
            payload.model.as_deref(),
            payload.resume_session_id.as_deref(),
        )
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e, "code": "CREATE_FAILED"})),
            )
        })?;

    Ok((StatusCode::CREATED, Json(json!(summary))))
}

/// `DELETE /api/agents/{id}` — soft-cancel the in-flight turn.
pub async fn interrupt_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    state.engine.interrupt(&id).await.map_err(|e| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": e, "code": "SESSION_NOT_FOUND"})),
        )
    })?;
    Ok(StatusCode::NO_CONTENT)
}
