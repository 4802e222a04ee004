//! Port Interfaces
//!
//! Contracts between the coordinator and its collaborators, following the
//! Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Transport`]: opens physical connections and relays wire frames
//! - [`EventStore`]: fire-and-forget persistence hook for delivered events
//!
//! The coordinator is the only driver: it opens connections, sends frames
//! through [`ConnectionHandle`]s, and consumes [`ConnectionEvent`]s the
//! transport pushes back.

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::{ConnectionId, SubscriptionId};

// =============================================================================
// Wire Frames
// =============================================================================

/// An outbound frame, tagged with the subscription it belongs to.
#[derive(Debug, Clone)]
pub enum WireFrame {
    /// Subscribe to a feed.
    Subscribe {
        /// Local subscription id the frame is sent on behalf of.
        subscription_id: SubscriptionId,
        /// The wire subscription object built by the descriptor.
        request: Value,
    },
    /// Unsubscribe from a feed.
    Unsubscribe {
        /// Local subscription id the frame is sent on behalf of.
        subscription_id: SubscriptionId,
        /// The wire subscription object originally subscribed with.
        request: Value,
    },
}

impl WireFrame {
    /// The subscription id the frame is tagged with.
    #[must_use]
    pub fn subscription_id(&self) -> &str {
        match self {
            Self::Subscribe {
                subscription_id, ..
            }
            | Self::Unsubscribe {
                subscription_id, ..
            } => subscription_id,
        }
    }

    /// Render the upstream message envelope.
    #[must_use]
    pub fn to_message(&self) -> Value {
        match self {
            Self::Subscribe { request, .. } => json!({
                "method": "subscribe",
                "subscription": request,
            }),
            Self::Unsubscribe { request, .. } => json!({
                "method": "unsubscribe",
                "subscription": request,
            }),
        }
    }
}

// =============================================================================
// Connection Events
// =============================================================================

/// Asynchronous notifications a connection pushes to the coordinator.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A payload arrived on the connection.
    Inbound {
        /// The connection that received it.
        connection: ConnectionId,
        /// Decoded JSON payload.
        payload: Value,
    },
    /// The connection reported an error.
    Error {
        /// The connection that errored.
        connection: ConnectionId,
        /// Human-readable error payload.
        message: String,
        /// Subscription ids the error is scoped to, when attributable.
        affected: Option<Vec<SubscriptionId>>,
    },
    /// The connection terminated. Emitted exactly once per connection.
    Closed {
        /// The connection that died.
        connection: ConnectionId,
    },
}

// =============================================================================
// Connection Handle
// =============================================================================

/// Live reference to one physical connection.
///
/// Frames are queued to the connection's I/O task; [`close`](Self::close)
/// cancels the task, which the per-connection watcher reports back as a
/// [`ConnectionEvent::Closed`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    key: String,
    outbound: mpsc::Sender<WireFrame>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle over an I/O task's frame queue and cancel token.
    #[must_use]
    pub const fn new(
        id: ConnectionId,
        key: String,
        outbound: mpsc::Sender<WireFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            key,
            outbound,
            cancel,
        }
    }

    /// The connection's identity.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// The routing key this connection was opened for.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the connection's I/O task is still accepting frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queue a frame for sending.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SendFailed`] when the I/O task is gone.
    pub async fn send(&self, frame: WireFrame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::SendFailed)
    }

    /// Tear the connection down.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Transport Port
// =============================================================================

/// Opens physical connections on behalf of the coordinator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection for `key` targeting `url`.
    ///
    /// The implementation must spawn whatever tasks it needs, deliver
    /// inbound payloads and errors to `events`, and guarantee exactly one
    /// [`ConnectionEvent::Closed`] for `id` once the connection dies —
    /// whether killed via the handle or by the remote side.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectFailed`] when the session cannot be
    /// established.
    async fn open(
        &self,
        id: ConnectionId,
        key: &str,
        url: &str,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<ConnectionHandle, TransportError>;
}

/// Transport-level failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The session could not be established.
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    /// The connection's I/O task is no longer accepting frames.
    #[error("connection is closed")]
    SendFailed,
}

// =============================================================================
// Storage Port
// =============================================================================

/// Fire-and-forget persistence hook for delivered events.
///
/// The coordinator never observes the outcome; a slow or failing store must
/// not block delivery.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist one event from `feed`.
    async fn store(&self, feed: &str, event: Value);
}

/// Store that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

#[async_trait]
impl EventStore for NullStore {
    async fn store(&self, _feed: &str, _event: Value) {}
}

/// Store that logs events at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStore;

#[async_trait]
impl EventStore for TracingStore {
    async fn store(&self, feed: &str, event: Value) {
        tracing::debug!(feed, %event, "Stored event");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_envelope() {
        let frame = WireFrame::Subscribe {
            subscription_id: "sub-1".to_string(),
            request: json!({"type": "trades", "coin": "BTC"}),
        };

        let message = frame.to_message();
        assert_eq!(message["method"], json!("subscribe"));
        assert_eq!(message["subscription"]["coin"], json!("BTC"));
        assert_eq!(frame.subscription_id(), "sub-1");
    }

    #[test]
    fn unsubscribe_frame_envelope() {
        let frame = WireFrame::Unsubscribe {
            subscription_id: "sub-2".to_string(),
            request: json!({"type": "allMids"}),
        };

        let message = frame.to_message();
        assert_eq!(message["method"], json!("unsubscribe"));
        assert_eq!(message["subscription"]["type"], json!("allMids"));
    }

    #[tokio::test]
    async fn handle_send_and_liveness() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(
            ConnectionId(1),
            "shared".to_string(),
            tx,
            CancellationToken::new(),
        );

        assert!(handle.is_open());
        handle
            .send(WireFrame::Subscribe {
                subscription_id: "sub-1".to_string(),
                request: json!({"type": "allMids"}),
            })
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.subscription_id(), "sub-1");

        drop(rx);
        assert!(!handle.is_open());
        let result = handle
            .send(WireFrame::Unsubscribe {
                subscription_id: "sub-1".to_string(),
                request: json!({"type": "allMids"}),
            })
            .await;
        assert!(matches!(result, Err(TransportError::SendFailed)));
    }

    #[tokio::test]
    async fn null_store_accepts_anything() {
        NullStore.store("userFills", json!({"oid": 1})).await;
    }
}
