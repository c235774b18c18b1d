//! WebSocket handler.
//!
//! Flow per connection:
//! 1. Accept WS upgrade, register a `Connected` entry with its outbound queue
//! 2. Spawn the writer task that drains the queue into the socket
//! 3. Reader loop: authenticate / request_balance frames
//! 4. On close, error, or server shutdown: deregister (ends the writer)

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::PulseError;
use crate::state::AppState;
use crate::types::{ClientMessage, ConnectionId, ServerMessage};

/// Axum handler for GET /ws — upgrades to WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection lifecycle.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<ServerMessage>(state.config.send_queue);

    let id = state.registry.connect(tx);
    info!(connection_id = %id, live = state.registry.len(), "client connected");

    let writer = tokio::spawn(writer_task(id, sender, rx));

    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            frame = receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                if let Err(e) = handle_client_message(&text, id, &state) {
                    debug!(connection_id = %id, "ignored frame: {e}");
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Ping(_))) => { /* axum auto-pongs */ }
            Some(Ok(_)) => { /* binary frames ignored */ }
            Some(Err(e)) => {
                warn!(connection_id = %id, "ws recv error: {e}");
                break;
            }
        }
    }

    state.registry.disconnect(id);
    info!(connection_id = %id, live = state.registry.len(), "client disconnected");

    if let Err(e) = writer.await {
        warn!(connection_id = %id, "writer task failed: {e}");
    }
}

/// Handle one text frame.
fn handle_client_message(
    text: &str,
    id: ConnectionId,
    state: &AppState,
) -> Result<(), PulseError> {
    let client_msg: ClientMessage =
        serde_json::from_str(text).map_err(|e| PulseError::Protocol(format!("invalid JSON: {e}")))?;

    match client_msg {
        ClientMessage::Authenticate(auth) => {
            state.registry.authenticate(id, auth.user_id);
        }
        ClientMessage::RequestBalance(req) => {
            state.dispatcher.request_balance(id, &req.user_id);
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
// Writer
// ═══════════════════════════════════════════════════════════════

type Sender = SplitSink<WebSocket, Message>;

/// Drains the connection's queue in FIFO order. Ends when every outbox clone
/// has been dropped (i.e. the registry entry is gone) or the socket fails.
async fn writer_task(id: ConnectionId, mut sender: Sender, mut rx: mpsc::Receiver<ServerMessage>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = send_msg(&mut sender, &msg).await {
            debug!(connection_id = %id, kind = msg.kind(), "send failed: {e}");
            break;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

async fn send_msg(sender: &mut Sender, msg: &ServerMessage) -> Result<(), PulseError> {
    let json = serde_json::to_string(msg)
        .map_err(|e| PulseError::Protocol(format!("serialize error: {e}")))?;
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| PulseError::Protocol(format!("send error: {e}")))?;
    Ok(())
}
