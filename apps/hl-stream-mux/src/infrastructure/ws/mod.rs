//! WebSocket Transport
//!
//! Implements the [`Transport`] port over tokio-tungstenite.
//!
//! Each `open` dials the target once and spawns two tasks: an I/O task that
//! owns the socket, and a watcher that reports [`ConnectionEvent::Closed`]
//! to the coordinator when the I/O task exits for any reason. There is no
//! socket-level auto-reconnect: a dead connection stays dead until a future
//! subscribe asks for its key again.
//!
//! # Liveness
//!
//! The I/O task pings on an interval and treats any inbound traffic as
//! proof of life; a missing pong past the configured timeout closes the
//! connection.

use std::time::Instant;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    ConnectionEvent, ConnectionHandle, Transport, TransportError, WireFrame,
};
use crate::domain::subscription::ConnectionId;
use crate::infrastructure::config::WebSocketSettings;

/// WebSocket-backed transport.
#[derive(Debug, Clone)]
pub struct WsTransport {
    settings: WebSocketSettings,
}

impl WsTransport {
    /// Create a transport with the given connection settings.
    #[must_use]
    pub const fn new(settings: WebSocketSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(
        &self,
        id: ConnectionId,
        key: &str,
        url: &str,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<ConnectionHandle, TransportError> {
        tracing::info!(%id, key, url, "Dialing upstream");

        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (frame_tx, frame_rx) = mpsc::channel(self.settings.frame_capacity);
        let cancel = CancellationToken::new();

        let io = ConnectionIo {
            id,
            settings: self.settings.clone(),
            events: events.clone(),
            cancel: cancel.clone(),
        };
        let io_task = tokio::spawn(io.run(stream, frame_rx));

        // Watcher: exactly one Closed per connection, however the I/O task
        // ends — cancellation, socket death, or panic.
        tokio::spawn(async move {
            let _ = io_task.await;
            let _ = events.send(ConnectionEvent::Closed { connection: id }).await;
        });

        Ok(ConnectionHandle::new(id, key.to_string(), frame_tx, cancel))
    }
}

struct ConnectionIo {
    id: ConnectionId,
    settings: WebSocketSettings,
    events: mpsc::Sender<ConnectionEvent>,
    cancel: CancellationToken,
}

impl ConnectionIo {
    async fn run<S>(self, stream: WebSocketStream<S>, mut frames: mpsc::Receiver<WireFrame>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut write, mut read) = stream.split();

        let mut ping_interval = tokio::time::interval(self.settings.heartbeat_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh connection
        // is not instantly pinged.
        ping_interval.tick().await;

        let mut last_seen = Instant::now();
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!(id = %self.id, "Connection cancelled");
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                _ = ping_interval.tick() => {
                    if awaiting_pong && last_seen.elapsed() > self.settings.heartbeat_timeout {
                        tracing::warn!(
                            id = %self.id,
                            silent_secs = last_seen.elapsed().as_secs(),
                            "Heartbeat timeout, closing connection"
                        );
                        break;
                    }
                    if write.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    awaiting_pong = true;
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        // Handle dropped; the coordinator tore us down.
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    };
                    if !self.send_frame(&mut write, frame).await {
                        break;
                    }
                }
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            last_seen = Instant::now();
                            awaiting_pong = false;
                            self.forward_text(&text).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_seen = Instant::now();
                            awaiting_pong = false;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if write.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!(id = %self.id, "Server sent close frame");
                            break;
                        }
                        Some(Ok(_)) => {
                            // Ignore binary and raw frames.
                        }
                        Some(Err(e)) => {
                            tracing::warn!(id = %self.id, error = %e, "WebSocket read error");
                            break;
                        }
                        None => {
                            tracing::info!(id = %self.id, "WebSocket stream ended");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Serialize and send one frame. Returns `false` when the socket died;
    /// the failure is attributed to the frame's subscription first.
    async fn send_frame<W>(&self, write: &mut W, frame: WireFrame) -> bool
    where
        W: SinkExt<Message> + Unpin,
        W::Error: std::fmt::Display,
    {
        let subscription_id = frame.subscription_id().to_string();
        let text = frame.to_message().to_string();

        if let Err(e) = write.send(Message::Text(text.into())).await {
            let _ = self
                .events
                .send(ConnectionEvent::Error {
                    connection: self.id,
                    message: format!("failed to send frame: {e}"),
                    affected: Some(vec![subscription_id]),
                })
                .await;
            return false;
        }
        true
    }

    async fn forward_text(&self, text: &str) {
        match serde_json::from_str::<Value>(text) {
            Ok(payload) => {
                let event = if payload.get("channel").and_then(Value::as_str) == Some("error") {
                    let message = payload
                        .get("data")
                        .map_or_else(|| text.to_string(), ToString::to_string);
                    // The upstream error channel names no subscription, so
                    // this stays unscoped.
                    ConnectionEvent::Error {
                        connection: self.id,
                        message,
                        affected: None,
                    }
                } else {
                    ConnectionEvent::Inbound {
                        connection: self.id,
                        payload,
                    }
                };
                let _ = self.events.send(event).await;
            }
            Err(e) => {
                tracing::warn!(id = %self.id, error = %e, "Discarding undecodable payload");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    async fn start_echo_server() -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let mut received = Vec::new();

            // Greet, then record whatever the client sends until it closes.
            ws.send(Message::Text(
                json!({"channel": "allMids", "data": {"mids": {}}})
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();

            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Text(text) => received.push(text.to_string()),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            received
        });

        (format!("ws://{addr}"), handle)
    }

    fn settings() -> WebSocketSettings {
        WebSocketSettings {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            frame_capacity: 16,
        }
    }

    #[tokio::test]
    async fn open_sends_envelopes_and_forwards_inbound() {
        let (url, server) = start_echo_server().await;
        let transport = WsTransport::new(settings());
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let handle = transport
            .open(ConnectionId(1), "shared", &url, events_tx)
            .await
            .unwrap();

        // The greeting payload arrives as an inbound event.
        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ConnectionEvent::Inbound {
                connection,
                payload,
            } => {
                assert_eq!(connection, ConnectionId(1));
                assert_eq!(payload["channel"], json!("allMids"));
            }
            other => panic!("expected inbound event, got {other:?}"),
        }

        handle
            .send(WireFrame::Subscribe {
                subscription_id: "sub-1".to_string(),
                request: json!({"type": "allMids"}),
            })
            .await
            .unwrap();

        // Give the I/O task a beat to flush the frame before closing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.close();

        // Watcher reports the close exactly once.
        let mut closed = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(2), events_rx.recv()).await
        {
            if matches!(event, ConnectionEvent::Closed { connection } if connection == ConnectionId(1))
            {
                closed = true;
                break;
            }
        }
        assert!(closed, "expected a Closed event");

        let received = server.await.unwrap();
        assert_eq!(received.len(), 1);
        let sent: Value = serde_json::from_str(&received[0]).unwrap();
        assert_eq!(sent["method"], json!("subscribe"));
        assert_eq!(sent["subscription"]["type"], json!("allMids"));
    }

    #[tokio::test]
    async fn server_disconnect_emits_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            // Drop immediately: the client should observe termination.
            drop(ws);
        });

        let transport = WsTransport::new(settings());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let _handle = transport
            .open(ConnectionId(7), "l2Book:BTC", &format!("ws://{addr}"), events_tx)
            .await
            .unwrap();

        let mut closed = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(2), events_rx.recv()).await
        {
            if matches!(event, ConnectionEvent::Closed { connection } if connection == ConnectionId(7))
            {
                closed = true;
                break;
            }
        }
        assert!(closed, "expected a Closed event after server disconnect");
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let transport = WsTransport::new(settings());
        let (events_tx, _events_rx) = mpsc::channel(16);

        let result = transport
            .open(
                ConnectionId(9),
                "shared",
                "ws://127.0.0.1:1/ws",
                events_tx,
            )
            .await;

        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    }
}
