use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use meet_proto::{ClientMessage, ServerMessage};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::AppState;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

/// Drive one signaling connection until the peer goes away.
///
/// Frames from a single socket are dispatched in arrival order, so a
/// member's join is applied before any later chat or signal it sends.
async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // The registry owns the only sender; once it forgets this connection
    // (disconnect or heartbeat timeout) the writer drains and closes.
    let connection_id = state.registry.connect(tx);

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message.to_json() {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(target: "signaling", connection_id = %writer_id, "failed to encode frame: {err}"),
            }
        }
        let _ = sender.send(Message::Close(None)).await;
        debug!(target: "signaling", connection_id = %writer_id, "writer task ended");
    });

    debug!(
        target: "signaling",
        connection_id = %connection_id,
        remote_addr = %remote_addr,
        "websocket connected"
    );

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(target: "signaling", connection_id = %connection_id, "websocket error: {err}");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            // Some clients send JSON in binary frames.
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(target: "signaling", connection_id = %connection_id, "non-UTF8 binary frame ignored");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => {
                debug!(target: "signaling", connection_id = %connection_id, ?message, "client frame");
                state.registry.dispatch(&connection_id, message);
            }
            Err(err) => {
                warn!(target: "signaling", connection_id = %connection_id, "invalid client frame dropped: {err}");
            }
        }
    }

    state.registry.disconnect(&connection_id);
    writer.abort();
    debug!(target: "signaling", connection_id = %connection_id, "websocket disconnected");
}
