//! Subscription Coordinator
//!
//! The multiplexing core: turns typed subscribe requests into
//! connection-routing decisions, deduplicates equivalent requests, fans
//! inbound payloads out to listeners, and contains connection failure.
//!
//! # Serialization model
//!
//! All state lives inside one actor task. Public commands and transport
//! events funnel through a single ordered queue, so no two routing
//! decisions ever interleave and the connection/subscription maps need no
//! locks. Connections run as independent tasks and may block on I/O
//! without stalling the coordinator; they only communicate through the
//! queue. Callbacks run synchronously inside the loop — a slow callback
//! delays all routing, so listeners must hand expensive work off.
//!
//! # Connection pool invariants
//!
//! A pool entry exists exactly while at least one subscription references
//! its key. The last unsubscribe tears the connection down; a crashed
//! connection leaves its subscriptions behind with a cleared handle, and
//! is only replaced when a future subscribe needs the same key.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    ConnectionEvent, ConnectionHandle, EventStore, Transport, TransportError, WireFrame,
};
use crate::domain::feed::{Endpoints, FeedKind, FeedParams, ValidationError};
use crate::domain::subscription::{
    ConnectionId, DeliveryStats, EventCallback, Subscription, SubscriptionId, SubscriptionMetrics,
    SubscriptionSnapshot, connection_key, params_equivalent,
};
use crate::infrastructure::metrics as mux_metrics;
use crate::infrastructure::registry::SubscriptionIndex;

// =============================================================================
// Configuration
// =============================================================================

/// Coordinator behavior knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// WebSocket endpoints descriptors resolve against.
    pub endpoints: Endpoints,
    /// Prune subscriptions on unscoped transport errors instead of the
    /// legacy notify-only behavior.
    pub prune_on_unscoped_error: bool,
    /// Capacity of the coordinator's command/event queue.
    pub queue_capacity: usize,
    /// Capacity of the transport event channel feeding the queue.
    pub event_capacity: usize,
}

impl CoordinatorConfig {
    /// Create a configuration with default capacities.
    #[must_use]
    pub const fn new(endpoints: Endpoints) -> Self {
        Self {
            endpoints,
            prune_on_unscoped_error: false,
            queue_capacity: 256,
            event_capacity: 1024,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Subscribe failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscribeError {
    /// The request failed descriptor validation.
    #[error("invalid subscribe request: {0}")]
    Validation(#[from] ValidationError),
    /// The transport could not establish or use a connection.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    /// The coordinator has shut down.
    #[error("coordinator is shut down")]
    Shutdown,
}

/// Lookup or unsubscribe failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// No subscription with the given id exists.
    #[error("subscription {0} not found")]
    NotFound(SubscriptionId),
    /// The coordinator has shut down.
    #[error("coordinator is shut down")]
    Shutdown,
}

// =============================================================================
// Public Surface
// =============================================================================

/// Summary of one pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Routing key the connection serves.
    pub key: String,
    /// Connection identity.
    pub id: ConnectionId,
    /// Whether the connection is still accepting frames.
    pub open: bool,
    /// Number of subscriptions routing through it.
    pub subscription_count: usize,
}

enum Command {
    Subscribe {
        kind: FeedKind,
        params: FeedParams,
        callback: Option<EventCallback>,
        reply: oneshot::Sender<Result<SubscriptionId, SubscribeError>>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<Result<(), LookupError>>,
    },
    ListSubscriptions {
        reply: oneshot::Sender<Vec<SubscriptionSnapshot>>,
    },
    GetSubscription {
        id: SubscriptionId,
        reply: oneshot::Sender<Result<SubscriptionSnapshot, LookupError>>,
    },
    ListForPrincipal {
        principal: String,
        reply: oneshot::Sender<Vec<SubscriptionSnapshot>>,
    },
    ConnectionInfo {
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    GetMetrics {
        id: SubscriptionId,
        reply: oneshot::Sender<Result<SubscriptionMetrics, LookupError>>,
    },
    ListAllMetrics {
        reply: oneshot::Sender<Vec<SubscriptionMetrics>>,
    },
}

enum CoordinatorMessage {
    Command(Command),
    Transport(ConnectionEvent),
}

/// Handle to a running coordinator.
///
/// Cheap to clone; all methods serialize through the coordinator's queue.
/// For lock-light reads that bypass the queue, use [`index`](Self::index).
#[derive(Clone)]
pub struct Coordinator {
    tx: mpsc::Sender<CoordinatorMessage>,
    index: SubscriptionIndex,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Spawn a coordinator over the given transport and event store.
    #[must_use]
    pub fn spawn(
        config: CoordinatorConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(config.queue_capacity);
        let (event_tx, mut event_rx) = mpsc::channel(config.event_capacity);
        let index = SubscriptionIndex::new();
        let cancel = CancellationToken::new();

        // Transport notifications join the same ordered queue as commands.
        let forward_tx = msg_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if forward_tx
                    .send(CoordinatorMessage::Transport(event))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let actor = CoordinatorActor {
            config,
            transport,
            store,
            connections: HashMap::new(),
            subscriptions: HashMap::new(),
            next_subscription: 0,
            next_connection: 0,
            event_tx,
            index: index.clone(),
        };
        tokio::spawn(actor.run(msg_rx, cancel.clone()));

        Self {
            tx: msg_tx,
            index,
            cancel,
        }
    }

    /// Subscribe to a feed.
    ///
    /// Returns the id of either a freshly created subscription or an
    /// equivalent live one (dedup). When deduplicated onto an existing
    /// subscription and a callback is supplied, it replaces the stored one.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError`] on validation or transport failure, or
    /// when the coordinator has shut down.
    pub async fn subscribe(
        &self,
        kind: FeedKind,
        params: FeedParams,
        callback: Option<EventCallback>,
    ) -> Result<SubscriptionId, SubscribeError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Subscribe {
            kind,
            params,
            callback,
            reply,
        })
        .await
        .map_err(|()| SubscribeError::Shutdown)?;
        response.await.map_err(|_| SubscribeError::Shutdown)?
    }

    /// Remove a subscription.
    ///
    /// Takes effect immediately; the upstream unsubscribe frame is
    /// best-effort. A second call for the same id reports `NotFound`.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::NotFound`] for unknown ids.
    pub async fn unsubscribe(&self, id: &str) -> Result<(), LookupError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Unsubscribe {
            id: id.to_string(),
            reply,
        })
        .await
        .map_err(|()| LookupError::Shutdown)?;
        response.await.map_err(|_| LookupError::Shutdown)?
    }

    /// List all subscriptions.
    pub async fn list_subscriptions(&self) -> Vec<SubscriptionSnapshot> {
        let (reply, response) = oneshot::channel();
        if self
            .send(Command::ListSubscriptions { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Get one subscription.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::NotFound`] for unknown ids.
    pub async fn get_subscription(&self, id: &str) -> Result<SubscriptionSnapshot, LookupError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::GetSubscription {
            id: id.to_string(),
            reply,
        })
        .await
        .map_err(|()| LookupError::Shutdown)?;
        response.await.map_err(|_| LookupError::Shutdown)?
    }

    /// List subscriptions carrying the given principal.
    pub async fn list_subscriptions_for_principal(
        &self,
        principal: &str,
    ) -> Vec<SubscriptionSnapshot> {
        let (reply, response) = oneshot::channel();
        if self
            .send(Command::ListForPrincipal {
                principal: principal.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Summarize the connection pool.
    pub async fn connection_info(&self) -> Vec<ConnectionInfo> {
        let (reply, response) = oneshot::channel();
        if self.send(Command::ConnectionInfo { reply }).await.is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Compute rate metrics for one subscription.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::NotFound`] for unknown ids.
    pub async fn get_metrics(&self, id: &str) -> Result<SubscriptionMetrics, LookupError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::GetMetrics {
            id: id.to_string(),
            reply,
        })
        .await
        .map_err(|()| LookupError::Shutdown)?;
        response.await.map_err(|_| LookupError::Shutdown)?
    }

    /// Compute rate metrics for every subscription.
    pub async fn list_all_metrics(&self) -> Vec<SubscriptionMetrics> {
        let (reply, response) = oneshot::channel();
        if self.send(Command::ListAllMetrics { reply }).await.is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// The concurrent-read snapshot index.
    ///
    /// Safe to read from any task without touching the coordinator queue;
    /// contents trail the authoritative state by at most one transition.
    #[must_use]
    pub const fn index(&self) -> &SubscriptionIndex {
        &self.index
    }

    /// Stop the coordinator and tear down all connections.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn send(&self, command: Command) -> Result<(), ()> {
        self.tx
            .send(CoordinatorMessage::Command(command))
            .await
            .map_err(|_| ())
    }
}

// =============================================================================
// Actor
// =============================================================================

struct CoordinatorActor {
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn EventStore>,
    connections: HashMap<String, ConnectionHandle>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    next_subscription: u64,
    next_connection: u64,
    event_tx: mpsc::Sender<ConnectionEvent>,
    index: SubscriptionIndex,
}

impl CoordinatorActor {
    async fn run(mut self, mut rx: mpsc::Receiver<CoordinatorMessage>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(CoordinatorMessage::Command(command)) => self.handle_command(command).await,
                    Some(CoordinatorMessage::Transport(event)) => self.handle_event(event),
                    None => break,
                },
            }
        }

        tracing::info!(
            connections = self.connections.len(),
            subscriptions = self.subscriptions.len(),
            "Coordinator stopping"
        );
        for handle in self.connections.values() {
            handle.close();
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                kind,
                params,
                callback,
                reply,
            } => {
                let result = self.subscribe(kind, params, callback).await;
                let _ = reply.send(result);
            }
            Command::Unsubscribe { id, reply } => {
                let result = self.unsubscribe(&id).await;
                let _ = reply.send(result);
            }
            Command::ListSubscriptions { reply } => {
                let snapshots = self
                    .subscriptions
                    .values()
                    .map(Subscription::snapshot)
                    .collect();
                let _ = reply.send(snapshots);
            }
            Command::GetSubscription { id, reply } => {
                let result = self
                    .subscriptions
                    .get(&id)
                    .map(Subscription::snapshot)
                    .ok_or(LookupError::NotFound(id));
                let _ = reply.send(result);
            }
            Command::ListForPrincipal { principal, reply } => {
                let wanted = principal.to_lowercase();
                let snapshots = self
                    .subscriptions
                    .values()
                    .filter(|record| record.principal().as_deref() == Some(wanted.as_str()))
                    .map(Subscription::snapshot)
                    .collect();
                let _ = reply.send(snapshots);
            }
            Command::ConnectionInfo { reply } => {
                let info = self
                    .connections
                    .iter()
                    .map(|(key, handle)| ConnectionInfo {
                        key: key.clone(),
                        id: handle.id(),
                        open: handle.is_open(),
                        subscription_count: self
                            .subscriptions
                            .values()
                            .filter(|record| record.connection_key == *key)
                            .count(),
                    })
                    .collect();
                let _ = reply.send(info);
            }
            Command::GetMetrics { id, reply } => {
                let now = Utc::now();
                let result = self
                    .subscriptions
                    .get(&id)
                    .map(|record| record.stats.metrics(&record.id, record.subscribed_at, now))
                    .ok_or(LookupError::NotFound(id));
                let _ = reply.send(result);
            }
            Command::ListAllMetrics { reply } => {
                let now = Utc::now();
                let all = self
                    .subscriptions
                    .values()
                    .map(|record| record.stats.metrics(&record.id, record.subscribed_at, now))
                    .collect();
                let _ = reply.send(all);
            }
        }
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Inbound {
                connection,
                payload,
            } => self.route_inbound(connection, &payload),
            ConnectionEvent::Error {
                connection,
                message,
                affected,
            } => self.handle_error(connection, &message, affected),
            ConnectionEvent::Closed { connection } => self.handle_closed(connection),
        }
    }

    // =========================================================================
    // Subscribe / Unsubscribe
    // =========================================================================

    async fn subscribe(
        &mut self,
        kind: FeedKind,
        mut params: FeedParams,
        callback: Option<EventCallback>,
    ) -> Result<SubscriptionId, SubscribeError> {
        kind.normalize_params(&mut params);

        // Dedup: an equivalent subscription with a live connection absorbs
        // the request instead of opening a second upstream stream.
        if let Some(existing) = self.find_equivalent(kind, &params) {
            tracing::debug!(
                feed = kind.request_label(),
                id = %existing,
                "Deduplicated subscribe onto existing subscription"
            );
            if callback.is_some()
                && let Some(record) = self.subscriptions.get_mut(&existing)
            {
                record.callback = callback;
            }
            return Ok(existing);
        }

        let request = kind.build_request(&params)?;
        let key = connection_key(kind, &params, &self.config.endpoints);
        let url = kind.resolve_url(&self.config.endpoints);
        let handle = self.acquire_connection(&key, &url).await?;

        self.next_subscription += 1;
        let id = format!("sub-{}", self.next_subscription);

        let record = Subscription {
            id: id.clone(),
            kind,
            params,
            request: request.clone(),
            connection_key: key.clone(),
            connection: Some(handle.id()),
            callback,
            subscribed_at: Utc::now(),
            stats: DeliveryStats::default(),
        };
        self.index.publish(record.snapshot());
        self.subscriptions.insert(id.clone(), record);

        if let Err(error) = handle
            .send(WireFrame::Subscribe {
                subscription_id: id.clone(),
                request,
            })
            .await
        {
            // The connection died between acquisition and send; roll the
            // registration back so the caller can retry cleanly.
            self.subscriptions.remove(&id);
            self.index.remove(&id);
            self.teardown_if_unreferenced(&key);
            return Err(error.into());
        }

        tracing::info!(
            feed = kind.request_label(),
            id = %id,
            key = %key,
            "Subscribed"
        );
        mux_metrics::set_subscriptions(self.subscriptions.len());
        Ok(id)
    }

    async fn unsubscribe(&mut self, id: &str) -> Result<(), LookupError> {
        let Some(record) = self.subscriptions.remove(id) else {
            return Err(LookupError::NotFound(id.to_string()));
        };
        self.index.remove(id);

        if let Some(connection) = record.connection
            && let Some(handle) = self.connections.get(&record.connection_key)
            && handle.id() == connection
        {
            // Best-effort: the connection may be tearing down already.
            let _ = handle
                .send(WireFrame::Unsubscribe {
                    subscription_id: record.id.clone(),
                    request: record.request.clone(),
                })
                .await;
        }

        self.teardown_if_unreferenced(&record.connection_key);
        tracing::info!(feed = record.kind.request_label(), id, "Unsubscribed");
        mux_metrics::set_subscriptions(self.subscriptions.len());
        Ok(())
    }

    fn find_equivalent(&self, kind: FeedKind, params: &FeedParams) -> Option<SubscriptionId> {
        self.subscriptions
            .values()
            .find(|record| {
                record.kind == kind
                    && self.is_connection_live(record)
                    && params_equivalent(&record.params, params)
            })
            .map(|record| record.id.clone())
    }

    fn is_connection_live(&self, record: &Subscription) -> bool {
        record.connection.is_some_and(|connection| {
            self.connections
                .get(&record.connection_key)
                .is_some_and(|handle| handle.id() == connection && handle.is_open())
        })
    }

    // =========================================================================
    // Connection Pool
    // =========================================================================

    async fn acquire_connection(
        &mut self,
        key: &str,
        url: &str,
    ) -> Result<ConnectionHandle, TransportError> {
        if let Some(handle) = self.connections.get(key) {
            if handle.is_open() {
                return Ok(handle.clone());
            }
            // Crashed entry whose Closed notification is still in flight;
            // replace it silently.
            self.connections.remove(key);
        }

        self.next_connection += 1;
        let id = ConnectionId(self.next_connection);
        let handle = self
            .transport
            .open(id, key, url, self.event_tx.clone())
            .await?;

        tracing::info!(key, url, connection = %id, "Opened connection");
        self.connections.insert(key.to_string(), handle.clone());
        mux_metrics::set_connections(self.connections.len());
        Ok(handle)
    }

    fn teardown_if_unreferenced(&mut self, key: &str) {
        let referenced = self
            .subscriptions
            .values()
            .any(|record| record.connection_key == key);
        if !referenced && let Some(handle) = self.connections.remove(key) {
            tracing::info!(key, connection = %handle.id(), "Closing unreferenced connection");
            handle.close();
            mux_metrics::set_connections(self.connections.len());
        }
    }

    // =========================================================================
    // Routing
    // =========================================================================

    fn route_inbound(&mut self, connection: ConnectionId, payload: &Value) {
        let now = Utc::now();
        let store = Arc::clone(&self.store);
        let mut routed = 0usize;

        for record in self
            .subscriptions
            .values_mut()
            .filter(|record| record.connection == Some(connection))
        {
            record.stats.record(now);
            routed += 1;

            if record.kind.storage_enabled() {
                let data = payload.get("data").unwrap_or(payload);
                for mut event in record.kind.extract_events(data) {
                    merge_context(&mut event, &record.params);
                    let store = Arc::clone(&store);
                    let label = record.kind.request_label();
                    // Fire-and-forget: a slow store never blocks routing.
                    tokio::spawn(async move {
                        store.store(label, event).await;
                    });
                }
            }

            if let Some(callback) = &record.callback {
                callback(payload);
            }
            mux_metrics::record_message_routed(record.kind.request_label());
            self.index.publish(record.snapshot());
        }

        if routed == 0 {
            tracing::trace!(%connection, "Inbound payload matched no subscriptions");
        }
    }

    // =========================================================================
    // Failure Handling
    // =========================================================================

    fn handle_error(
        &mut self,
        connection: ConnectionId,
        message: &str,
        affected: Option<Vec<SubscriptionId>>,
    ) {
        mux_metrics::record_transport_error();

        if let Some(ids) = affected {
            tracing::warn!(%connection, error = message, count = ids.len(), "Scoped transport error");
            self.prune_with_notification(&ids, message);
            return;
        }

        // Legacy unscoped path: affected subscriptions are identified by
        // handle for notification only, and survive unless configured
        // otherwise.
        let ids: Vec<SubscriptionId> = self
            .subscriptions
            .values()
            .filter(|record| record.connection == Some(connection))
            .map(|record| record.id.clone())
            .collect();
        tracing::warn!(%connection, error = message, count = ids.len(), "Unscoped transport error");

        if self.config.prune_on_unscoped_error {
            self.prune_with_notification(&ids, message);
        } else {
            for id in &ids {
                if let Some(record) = self.subscriptions.get(id)
                    && let Some(callback) = &record.callback
                {
                    callback(&error_event(id, message));
                }
            }
        }
    }

    fn prune_with_notification(&mut self, ids: &[SubscriptionId], message: &str) {
        let mut touched: HashSet<String> = HashSet::new();

        for id in ids {
            let Some(record) = self.subscriptions.remove(id) else {
                continue;
            };
            self.index.remove(id);
            touched.insert(record.connection_key.clone());
            if let Some(callback) = &record.callback {
                callback(&error_event(id, message));
            }
        }

        for key in touched {
            self.teardown_if_unreferenced(&key);
        }
        mux_metrics::set_subscriptions(self.subscriptions.len());
    }

    fn handle_closed(&mut self, connection: ConnectionId) {
        let key = self
            .connections
            .iter()
            .find(|(_, handle)| handle.id() == connection)
            .map(|(key, _)| key.clone());
        if let Some(key) = &key {
            self.connections.remove(key);
            mux_metrics::set_connections(self.connections.len());
        }

        let mut stranded = 0usize;
        for record in self
            .subscriptions
            .values_mut()
            .filter(|record| record.connection == Some(connection))
        {
            record.connection = None;
            stranded += 1;
            self.index.publish(record.snapshot());
        }

        if key.is_some() || stranded > 0 {
            mux_metrics::record_connection_lost();
            tracing::warn!(
                %connection,
                key = key.as_deref().unwrap_or("<reaped>"),
                stranded,
                "Connection terminated; subscriptions retained without a handle"
            );
        }
    }
}

/// Synthetic error payload delivered to a subscription's callback.
fn error_event(id: &str, message: &str) -> Value {
    json!({
        "channel": "error",
        "data": {
            "subscription_id": id,
            "message": message,
        }
    })
}

/// Merge identity parameters into a stored event as context.
fn merge_context(event: &mut Value, params: &FeedParams) {
    if let Value::Object(map) = event {
        for field in ["user", "coin"] {
            if let Some(value) = params.get(field) {
                map.entry(field).or_insert_with(|| value.clone());
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
