//! WebSocket handler for real-time workflow event streaming.
//!
//! The `/ws/events` endpoint upgrades an HTTP connection to a WebSocket.
//! Once connected, the handler subscribes to the event bus and pushes every
//! `WorkflowEvent` to the client as a `{event, threadId, payload, ts}` frame.
//! Clients may filter by thread with the `?threadId=` query parameter or a
//! `subscribe` command.
//!
//! Lagged receivers (a client too slow to keep up) are logged and skipped --
//! missed events never block the executor. Disconnecting does **not** abort
//! running threads; aborting is an explicit `abort_thread` command.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;

use studio_types::event::WorkflowEvent;

use crate::state::AppState;

/// Query parameters for the event channel.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    /// Only deliver events for this thread.
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// Incoming command from a WebSocket client.
///
/// Unknown or malformed messages are logged and ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    /// Replace the thread filter (null/absent clears it).
    Subscribe { thread_id: Option<String> },
    /// Request an abort of a live thread.
    AbortThread { thread_id: String },
    /// Keep-alive ping. Server responds with `{"type":"pong"}`.
    Ping,
}

/// Upgrade an HTTP request to the event channel.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<EventsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, query.thread_id))
}

/// Serialize an event into the wire frame `{event, threadId, payload, ts}`.
fn event_frame(event: &WorkflowEvent) -> Option<String> {
    let mut payload = match serde_json::to_value(event) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) | Err(_) => return None,
    };
    payload.remove("event");
    payload.remove("thread_id");

    let frame = json!({
        "event": event.name(),
        "threadId": event.thread_id(),
        "payload": payload,
        "ts": Utc::now().to_rfc3339(),
    });
    serde_json::to_string(&frame).ok()
}

async fn handle_ws_connection(socket: WebSocket, state: AppState, filter: Option<String>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut event_rx = state.events.subscribe();
    let mut filter = filter;

    loop {
        tokio::select! {
            // --- Branch 1: forward bus events to the client ---
            event_result = event_rx.recv() => {
                match event_result {
                    Ok(event) => {
                        if let Some(wanted) = &filter {
                            if event.thread_id() != wanted {
                                continue;
                            }
                        }
                        let Some(frame) = event_frame(&event) else { continue };
                        if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "WebSocket subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            // --- Branch 2: process client commands ---
            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        process_command(&text, &mut ws_sender, &state, &mut filter).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!("WebSocket receive error: {err}");
                        break;
                    }
                    // Binary, ping, pong frames are handled by the transport.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!("WebSocket connection closed");
}

async fn process_command(
    text: &str,
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    state: &AppState,
    filter: &mut Option<String>,
) {
    let cmd: WsCommand = match serde_json::from_str(text) {
        Ok(cmd) => cmd,
        Err(err) => {
            tracing::warn!(raw = %text, error = %err, "ignoring malformed WebSocket command");
            return;
        }
    };

    match cmd {
        WsCommand::Subscribe { thread_id } => {
            tracing::debug!(thread_id = ?thread_id, "WebSocket filter updated");
            *filter = thread_id;
        }
        WsCommand::AbortThread { thread_id } => {
            if state.orchestrator.abort(&thread_id) {
                tracing::info!(thread_id = thread_id.as_str(), "abort requested via WebSocket");
            } else {
                tracing::warn!(
                    thread_id = thread_id.as_str(),
                    "abort_thread: no live worker for thread"
                );
            }
        }
        WsCommand::Ping => {
            let pong = r#"{"type":"pong"}"#;
            if ws_sender.send(Message::Text(pong.into())).await.is_err() {
                tracing::debug!("failed to send pong (client disconnecting)");
            }
        }
    }
}
