//! WebSocket endpoint for billing event delivery.
//!
//! Each connection subscribes the authenticated user to the event
//! broadcaster and forwards envelopes as JSON text frames. Delivery is
//! at-least-once while connected: a subscriber that falls behind the
//! channel capacity observes a lag, is told how many events it missed,
//! and resumes from the oldest retained event.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use callbill_core::UserId;

use crate::auth::AuthUser;
use crate::broadcaster::EventEnvelope;
use crate::state::AppState;

/// `GET /v1/ws` - upgrade to a billing event stream.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ws: WebSocketUpgrade,
) -> Response {
    let receiver = state.broadcaster.subscribe(user.user_id);
    ws.on_upgrade(move |socket| run_connection(socket, receiver, user.user_id))
}

async fn run_connection(
    mut socket: WebSocket,
    mut receiver: broadcast::Receiver<EventEnvelope>,
    user_id: UserId,
) {
    tracing::debug!(user_id = %user_id, "Billing event stream connected");

    loop {
        tokio::select! {
            event = receiver.recv() => match event {
                Ok(envelope) => {
                    let Ok(text) = serde_json::to_string(&envelope) else {
                        continue;
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        user_id = %user_id,
                        missed,
                        "Slow event subscriber lagged"
                    );
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                // Clients only listen; anything but a close is ignored.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!(user_id = %user_id, "Billing event stream disconnected");
}
