//! `GET /ws/events` — upgrades to a WebSocket that streams [`Event`]s as
//! JSON text frames, sending a snapshot of current tunnels first
//! (spec.md §4.12).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tracing::debug;

use super::AppState;

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let snapshot = state.manager.list_tunnels().await;
    let snapshot_frame = serde_json::json!({
        "event": "snapshot",
        "tunnels": snapshot,
    });
    if let Ok(text) = serde_json::to_string(&snapshot_frame) {
        if socket.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    let (handle, mut rx) = state.manager.events().subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("ws/events: client error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.manager.events().unsubscribe(handle);
}
