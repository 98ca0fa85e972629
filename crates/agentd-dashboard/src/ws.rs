//! WebSocket bridge between the event bus and dashboard clients
//!
//! Each connection subscribes to one user's event stream. Client `ping`
//! text frames refresh the subscriber's liveness and are answered with the
//! bus `pong` event; sinks that stay silent are dropped by the bus
//! keepalive sweep.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::api::DashboardState;

/// Handle a WebSocket upgrade for one user's event stream
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<i64>,
    State(state): State<Arc<DashboardState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: i64, state: Arc<DashboardState>) {
    let (subscriber_id, mut events) = state.bus.subscribe(user_id);
    info!(user_id, "dashboard client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let send_task = async move {
        while let Some(event) = events.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("cannot serialize event: {}", e);
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    };

    let bus = state.bus.clone();
    let recv_task = async move {
        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(WsMessage::Text(text)) => {
                    if text.trim().eq_ignore_ascii_case("ping") {
                        bus.note_pong(user_id, subscriber_id);
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                Err(e) => {
                    debug!(user_id, "websocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.bus.unsubscribe(user_id, subscriber_id);
    info!(user_id, "dashboard client disconnected");
}
