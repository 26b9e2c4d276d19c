//! WebSocket transport for session observation and input.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws/chat/{session_id}`. The upgrade attaches a
//!    read-only observer stream to the session.
//! 2. Server → client frames are newline-terminated JSON, in the observer
//!    contract order: one `agent_status`, one `history_snapshot`, then live
//!    `stream_item` / `agent_status` / control frames.
//! 3. Client → server messages are JSON objects with a `"type"` field.
//! 4. On disconnect the observer is released; the shared transform watcher
//!    survives iff other observers remain.
//!
//! ## Message types (client → server)
//!
//! | Type         | Fields | Effect                                    |
//! |--------------|--------|-------------------------------------------|
//! | `user_input` | `text` | Append to the session's queue and deliver |
//!
//! ## Message types (server → client)
//!
//! | Type                | Key fields                          |
//! |---------------------|-------------------------------------|
//! | `agent_status`      | `status` (`idle`/`thinking`/`error`)|
//! | `history_snapshot`  | `items[]`                           |
//! | `stream_item`       | `item`                              |
//! | `chat_title_update` | `title`                             |
//! | `unread_cleared`    | —                                   |
//! | `context_cleared`   | —                                   |
//! | `plan_mode_entered` | —                                   |

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::AppState;

/// `GET /ws/chat/{session_id}` — WebSocket upgrade handler.
#[allow(clippy::unused_async)] // axum handlers must be async
pub async fn ws_chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state, session_id))
}

/// Main WebSocket event loop.
///
/// Splits the socket into a sink (outgoing) and stream (incoming) and runs
/// both through `tokio::select!`: observer lines are forwarded out, and
/// `user_input` messages go through `engine.submit`. Each connection gets a
/// generated client id stamped onto its input entries.
async fn handle_ws(socket: axum::extract::ws::WebSocket, state: AppState, session_id: String) {
    let client_id = format!("ws-{}", Uuid::new_v4().simple());

    let mut observer = match state.engine.observe(&session_id, 0).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!("Session {session_id}: observer attach failed: {e}");
            return;
        }
    };

    let (mut ws_sink, mut ws_stream) = socket.split();
    debug!("Session {session_id}: client {client_id} connected");

    loop {
        tokio::select! {
            line = observer.recv() => {
                let Some(line) = line else { break };
                let framed = format!("{line}\n");
                if ws_sink
                    .send(axum::extract::ws::Message::Text(framed.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                match msg {
                    axum::extract::ws::Message::Text(text) => {
                        let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                            let _ = ws_sink
                                .send(axum::extract::ws::Message::Text(
                                    error_line("INVALID_JSON", "Failed to parse JSON message")
                                        .into(),
                                ))
                                .await;
                            continue;
                        };
                        match parsed["type"].as_str().unwrap_or("") {
                            "user_input" => {
                                let Some(input) = parsed["text"].as_str() else {
                                    let _ = ws_sink
                                        .send(axum::extract::ws::Message::Text(
                                            error_line("MISSING_FIELD", "text is required")
                                                .into(),
                                        ))
                                        .await;
                                    continue;
                                };
                                if let Err(e) =
                                    state.engine.submit(&session_id, &client_id, input).await
                                {
                                    warn!("Session {session_id}: submit failed: {e}");
                                    let _ = ws_sink
                                        .send(axum::extract::ws::Message::Text(
                                            error_line("SUBMIT_FAILED", &e).into(),
                                        ))
                                        .await;
                                }
                            }
                            other => {
                                let _ = ws_sink
                                    .send(axum::extract::ws::Message::Text(
                                        error_line(
                                            "UNKNOWN_TYPE",
                                            &format!("Unknown message type: {other}"),
                                        )
                                        .into(),
                                    ))
                                    .await;
                            }
                        }
                    }
                    axum::extract::ws::Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    // Dropping the observer receiver cancels the observer task, which
    // releases the shared transform watcher refcount.
    debug!("Session {session_id}: client {client_id} disconnected");
}

fn error_line(code: &str, message: &str) -> String {
    format!(
        "{}\n",
        json!({ "type": "error", "code": code, "message": message })
    )
}
