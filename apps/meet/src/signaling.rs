use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meet_proto::{ClientMessage, ConnectionId, ServerMessage};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::MeetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connecting,
    Connected,
    /// The socket dropped. There is no automatic reconnect.
    Disconnected,
}

/// Accepts `ws(s)://` or `http(s)://` server addresses and points them at
/// the signaling endpoint.
pub fn websocket_url(server: &str) -> Result<Url, MeetError> {
    let mut url = Url::parse(server)
        .map_err(|err| MeetError::Setup(format!("invalid server url {server}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(MeetError::Setup(format!(
                "unsupported server url scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| MeetError::Setup("invalid websocket scheme".into()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    Ok(url)
}

/// Connection to meet-road. Outbound frames go through an unbounded queue
/// drained by a writer task so callers never block on the socket.
pub struct SignalingClient {
    connection_id: ConnectionId,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    status: watch::Receiver<TransportStatus>,
    shutdown: Arc<Notify>,
    writer: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Open the socket and wait for the server to assign our connection id.
    pub async fn connect(
        server: &str,
        heartbeat: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>), MeetError> {
        let url = websocket_url(server)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| MeetError::Signaling(format!("websocket connect failed: {err}")))?;
        debug!(target: "signaling", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (status_tx, status) = watch::channel(TransportStatus::Connecting);

        let connection_id = loop {
            let frame = match ws_read.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(MeetError::Signaling(err.to_string())),
                None => return Err(MeetError::ChannelClosed),
            };
            let Some(message) = parse_frame(frame) else {
                continue;
            };
            match message {
                ServerMessage::Connected { connection_id } => break connection_id,
                other => trace!(target: "signaling", ?other, "frame before connected ignored"),
            }
        };
        let _ = status_tx.send(TransportStatus::Connected);

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let shutdown = Arc::new(Notify::new());

        let writer_shutdown = shutdown.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = send_rx.recv() => {
                        let Some(message) = message else { break };
                        if send_frame(&mut ws_write, &message).await.is_err() {
                            return;
                        }
                    }
                    _ = writer_shutdown.notified() => {
                        while let Ok(message) = send_rx.try_recv() {
                            if send_frame(&mut ws_write, &message).await.is_err() {
                                return;
                            }
                        }
                        break;
                    }
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
            debug!(target: "signaling", "writer task ended");
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Close(_)) => break,
                    Ok(frame) => {
                        if let Some(message) = parse_frame(frame) {
                            if inbound_tx.send(message).is_err() {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(target: "signaling", "signaling websocket closed: {err}");
                            }
                            _ => warn!(target: "signaling", "signaling websocket error: {err}"),
                        }
                        break;
                    }
                }
            }
            let _ = status_tx.send(TransportStatus::Disconnected);
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let client = SignalingClient {
            connection_id,
            send_tx,
            status,
            shutdown,
            writer: Mutex::new(Some(writer)),
            tasks: Mutex::new(vec![reader, heartbeat_task]),
        };
        Ok((client, inbound_rx))
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.send_tx.clone()
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), MeetError> {
        self.send_tx
            .send(message)
            .map_err(|_| MeetError::ChannelClosed)
    }

    pub fn status(&self) -> watch::Receiver<TransportStatus> {
        self.status.clone()
    }

    /// Flush queued frames, send a close frame and wait for the writer.
    pub async fn close(&self) {
        self.shutdown.notify_one();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        // The writer is left running so frames already queued still go out.
        self.shutdown.notify_one();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

fn parse_frame(frame: Message) -> Option<ServerMessage> {
    let text = match frame {
        Message::Text(text) => text,
        Message::Binary(data) => String::from_utf8(data).ok()?,
        _ => return None,
    };
    match serde_json::from_str::<ServerMessage>(&text) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(target: "signaling", "unparseable server frame dropped: {err}");
            None
        }
    }
}

async fn send_frame<S>(sink: &mut S, message: &ClientMessage) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let json = match message.to_json() {
        Ok(json) => json,
        Err(err) => {
            warn!(target: "signaling", "failed to encode frame: {err}");
            return Ok(());
        }
    };
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn http_urls_map_to_websocket_endpoint() {
        assert_eq!(
            websocket_url("http://localhost:8080").unwrap().as_str(),
            "ws://localhost:8080/ws"
        );
        assert_eq!(
            websocket_url("https://meet.example.com/").unwrap().as_str(),
            "wss://meet.example.com/ws"
        );
        assert_eq!(
            websocket_url("ws://127.0.0.1:9000/custom").unwrap().as_str(),
            "ws://127.0.0.1:9000/custom"
        );
        assert!(websocket_url("ftp://example.com").is_err());
        assert!(websocket_url("not a url").is_err());
    }
}
