//! Subscription State and Keying
//!
//! Domain types for tracking live feed subscriptions: the authoritative
//! record owned by the coordinator, the read-only snapshot published to the
//! lookup index, connection key generation, dedup equivalence, and the
//! delivery-rate calculator.
//!
//! # Connection keys
//!
//! The key decides which physical connection a subscription's traffic flows
//! through. Key generation is a pure function of the descriptor and the
//! parameters: `shared` feeds collapse onto one key per endpoint,
//! `user_grouped` feeds collapse per principal, and `dedicated` feeds fan
//! out per key-field combination.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use crate::domain::feed::{ConnectionClass, Endpoints, FeedKind, FeedParams};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a subscription, assigned by the coordinator.
pub type SubscriptionId = String;

/// Identity of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Callback invoked for every payload routed to a subscription.
///
/// Runs synchronously inside the coordinator loop; hand expensive work off
/// to a task.
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Maximum number of delivery timestamps retained per subscription.
pub const RECENT_WINDOW: usize = 60;

/// Parameters that identify a subscription for dedup purposes.
///
/// Precision and paging parameters are bookkeeping, not identity.
const IDENTITY_PARAMS: &[&str] = &["user", "coin", "dex", "interval"];

// =============================================================================
// Subscription Record
// =============================================================================

/// A live subscription, owned exclusively by the coordinator.
#[derive(Clone)]
pub struct Subscription {
    /// Unique id for the coordinator's lifetime.
    pub id: SubscriptionId,
    /// The subscribed feed type.
    pub kind: FeedKind,
    /// Normalized subscribe parameters.
    pub params: FeedParams,
    /// The validated wire subscription object, reused for unsubscribe.
    pub request: Value,
    /// Key of the connection this subscription routes through.
    pub connection_key: String,
    /// Live connection identity, or `None` after the transport died.
    pub connection: Option<ConnectionId>,
    /// Listener for routed payloads.
    pub callback: Option<EventCallback>,
    /// When the subscription was created.
    pub subscribed_at: DateTime<Utc>,
    /// Delivery counters and recent-timestamp window.
    pub stats: DeliveryStats,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("connection_key", &self.connection_key)
            .field("connection", &self.connection)
            .field("callback", &self.callback.is_some())
            .field("message_count", &self.stats.message_count)
            .finish()
    }
}

impl Subscription {
    /// Whether the subscription currently has a live connection.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.connection.is_some()
    }

    /// The canonical principal value, if this subscription carries one.
    #[must_use]
    pub fn principal(&self) -> Option<String> {
        self.params
            .get("user")
            .map(|value| canonical_text(value).to_lowercase())
    }

    /// Produce the read-only snapshot published to the lookup index.
    #[must_use]
    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            params: self.params.clone(),
            connection_key: self.connection_key.clone(),
            connection_class: self.kind.connection_class(),
            alive: self.connection.is_some(),
            subscribed_at: self.subscribed_at,
            message_count: self.stats.message_count,
            last_message_at: self.stats.last_message_at,
        }
    }
}

/// Point-in-time view of a subscription for concurrent readers.
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    /// Subscription id.
    pub id: SubscriptionId,
    /// Subscribed feed type.
    pub kind: FeedKind,
    /// Normalized parameters.
    pub params: FeedParams,
    /// Connection routing key.
    pub connection_key: String,
    /// Connection-sharing class of the feed.
    pub connection_class: ConnectionClass,
    /// Whether the backing connection was live at snapshot time.
    pub alive: bool,
    /// Creation timestamp.
    pub subscribed_at: DateTime<Utc>,
    /// Total payloads delivered.
    pub message_count: u64,
    /// Timestamp of the most recent delivery.
    pub last_message_at: Option<DateTime<Utc>>,
}

impl SubscriptionSnapshot {
    /// The canonical principal value, if this subscription carries one.
    #[must_use]
    pub fn principal(&self) -> Option<String> {
        self.params
            .get("user")
            .map(|value| canonical_text(value).to_lowercase())
    }
}

// =============================================================================
// Key Generation
// =============================================================================

/// Compute the connection key for a feed and parameter set.
///
/// Pure: the same `(kind, params, endpoints)` always yields the same key.
/// Keys for non-default endpoints carry a host token so identical feeds on
/// different environments never collapse onto one connection.
#[must_use]
pub fn connection_key(kind: FeedKind, params: &FeedParams, endpoints: &Endpoints) -> String {
    let url = kind.resolve_url(endpoints);
    let suffix = if url == endpoints.api {
        String::new()
    } else {
        format!("@{}", url_token(&url))
    };

    match kind.connection_class() {
        ConnectionClass::Shared => format!("shared{suffix}"),
        ConnectionClass::UserGrouped => {
            let principal = params
                .get("user")
                .map_or_else(|| "unknown".to_string(), |v| canonical_text(v).to_lowercase());
            format!("user:{principal}{suffix}")
        }
        ConnectionClass::Dedicated => {
            let label = kind.request_label();
            let fields = kind.key_fields();
            if fields.is_empty() {
                format!("{label}{suffix}")
            } else {
                let values: Vec<String> = fields
                    .iter()
                    .map(|field| {
                        params
                            .get(*field)
                            .map_or_else(|| "nil".to_string(), canonical_text)
                    })
                    .collect();
                format!("{label}:{}{suffix}", values.join(":"))
            }
        }
    }
}

/// Whether two parameter sets describe the same logical subscription.
///
/// Compares only identity parameters, after normalizing value encodings so
/// `"5"` and `5`, or differently-cased addresses, match.
#[must_use]
pub fn params_equivalent(a: &FeedParams, b: &FeedParams) -> bool {
    IDENTITY_PARAMS.iter().all(|field| {
        let left = a.get(*field).map(|v| canonical_text(v).to_lowercase());
        let right = b.get(*field).map(|v| canonical_text(v).to_lowercase());
        left == right
    })
}

/// Render a parameter value without JSON string quoting.
fn canonical_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Reduce a WebSocket URL to its host for key suffixes.
fn url_token(url: &str) -> String {
    let stripped = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);
    stripped
        .split('/')
        .next()
        .unwrap_or(stripped)
        .to_string()
}

// =============================================================================
// Delivery Stats
// =============================================================================

/// Delivery counters and the capped recent-timestamp window.
#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    /// Total payloads delivered. Monotonically non-decreasing.
    pub message_count: u64,
    /// Timestamp of the most recent delivery.
    pub last_message_at: Option<DateTime<Utc>>,
    recent: VecDeque<DateTime<Utc>>,
}

impl DeliveryStats {
    /// Record one delivery at `at`.
    pub fn record(&mut self, at: DateTime<Utc>) {
        self.message_count += 1;
        self.last_message_at = Some(at);
        self.recent.push_back(at);
        if self.recent.len() > RECENT_WINDOW {
            self.recent.pop_front();
        }
    }

    /// Number of retained recent timestamps.
    #[must_use]
    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    /// Compute rate metrics as of `now` for a subscription created at
    /// `subscribed_at`.
    #[must_use]
    pub fn metrics(
        &self,
        id: &str,
        subscribed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SubscriptionMetrics {
        let uptime = now - subscribed_at;
        let uptime_seconds = delta_seconds(uptime).max(0.0);

        #[allow(clippy::cast_precision_loss)]
        let per_minute = self.message_count as f64 / uptime_seconds.max(f64::EPSILON) * 60.0;

        let window_start = now - TimeDelta::seconds(60);
        let last_60s = self.recent.iter().filter(|at| **at > window_start).count();

        let recent_rate = match (self.recent.front(), self.recent.len()) {
            (Some(oldest), len) if len >= 2 => {
                let span = delta_seconds(now - *oldest);
                if span > 0.0 {
                    #[allow(clippy::cast_precision_loss)]
                    let rate = len as f64 / span * 60.0;
                    rate
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        SubscriptionMetrics {
            id: id.to_string(),
            uptime_seconds,
            message_count: self.message_count,
            messages_per_minute: round2(per_minute),
            messages_last_60s: last_60s,
            recent_rate: round2(recent_rate),
        }
    }
}

/// Rate statistics derived from a subscription's delivery history.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionMetrics {
    /// Subscription id.
    pub id: SubscriptionId,
    /// Seconds since the subscription was created.
    pub uptime_seconds: f64,
    /// Total payloads delivered.
    pub message_count: u64,
    /// Lifetime delivery rate per minute, rounded to 2 decimals.
    pub messages_per_minute: f64,
    /// Deliveries within the last 60 seconds.
    pub messages_last_60s: usize,
    /// Delivery rate per minute over the retained window, rounded to 2
    /// decimals. Zero until at least two deliveries are retained.
    pub recent_rate: f64,
}

fn delta_seconds(delta: TimeDelta) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let millis = delta.num_milliseconds() as f64;
    millis / 1000.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn endpoints() -> Endpoints {
        Endpoints {
            api: "wss://api.hyperliquid.xyz/ws".to_string(),
            explorer: "wss://rpc.hyperliquid.xyz/ws".to_string(),
        }
    }

    fn params(pairs: &[(&str, Value)]) -> FeedParams {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn shared_feeds_share_one_key() {
        let endpoints = endpoints();
        let trades = connection_key(FeedKind::Trades, &params(&[("coin", json!("BTC"))]), &endpoints);
        let mids = connection_key(FeedKind::AllMids, &FeedParams::new(), &endpoints);

        assert_eq!(trades, "shared");
        assert_eq!(trades, mids);
    }

    #[test]
    fn dedicated_keys_isolate_by_key_fields() {
        let endpoints = endpoints();
        let btc = connection_key(FeedKind::L2Book, &params(&[("coin", json!("BTC"))]), &endpoints);
        let eth = connection_key(FeedKind::L2Book, &params(&[("coin", json!("ETH"))]), &endpoints);

        assert_eq!(btc, "l2Book:BTC");
        assert_eq!(eth, "l2Book:ETH");
        assert_ne!(btc, eth);
    }

    #[test]
    fn dedicated_missing_key_field_renders_nil() {
        let key = connection_key(FeedKind::L2Book, &FeedParams::new(), &endpoints());
        assert_eq!(key, "l2Book:nil");
    }

    #[test]
    fn user_grouped_keys_collapse_per_principal() {
        let endpoints = endpoints();
        let fills = connection_key(
            FeedKind::UserFills,
            &params(&[("user", json!("0xABCDEF"))]),
            &endpoints,
        );
        let orders = connection_key(
            FeedKind::OrderUpdates,
            &params(&[("user", json!("0xabcdef"))]),
            &endpoints,
        );

        assert_eq!(fills, "user:0xabcdef");
        assert_eq!(fills, orders);
    }

    #[test]
    fn user_grouped_without_principal_uses_unknown() {
        let key = connection_key(FeedKind::Notification, &FeedParams::new(), &endpoints());
        assert_eq!(key, "user:unknown");
    }

    #[test]
    fn explorer_keys_carry_host_suffix() {
        let key = connection_key(FeedKind::ExplorerBlock, &FeedParams::new(), &endpoints());
        assert_eq!(key, "explorerBlock@rpc.hyperliquid.xyz");
    }

    #[test]
    fn params_equivalent_normalizes_encodings() {
        let a = params(&[("user", json!("0xABC")), ("coin", json!("BTC"))]);
        let b = params(&[("user", json!("0xabc")), ("coin", json!("BTC"))]);
        assert!(params_equivalent(&a, &b));

        let c = params(&[("coin", json!("ETH"))]);
        assert!(!params_equivalent(&a, &c));
    }

    #[test]
    fn params_equivalent_ignores_bookkeeping_fields() {
        let a = params(&[("coin", json!("BTC")), ("nSigFigs", json!(5))]);
        let b = params(&[("coin", json!("BTC")), ("nSigFigs", json!(3))]);
        assert!(params_equivalent(&a, &b));
    }

    #[test]
    fn params_equivalent_distinguishes_intervals() {
        let a = params(&[("coin", json!("BTC")), ("interval", json!("1m"))]);
        let b = params(&[("coin", json!("BTC")), ("interval", json!("5m"))]);
        assert!(!params_equivalent(&a, &b));
    }

    #[test]
    fn delivery_stats_count_and_window() {
        let mut stats = DeliveryStats::default();
        let start = Utc::now();

        for i in 0..70 {
            stats.record(start + TimeDelta::milliseconds(i));
        }

        assert_eq!(stats.message_count, 70);
        assert_eq!(stats.recent_len(), RECENT_WINDOW);
        assert!(stats.last_message_at.is_some());
    }

    #[test]
    fn metrics_lifetime_rate() {
        let mut stats = DeliveryStats::default();
        let subscribed_at = Utc::now();
        let now = subscribed_at + TimeDelta::seconds(30);

        for i in 0..30 {
            stats.record(subscribed_at + TimeDelta::seconds(i));
        }

        let metrics = stats.metrics("sub-1", subscribed_at, now);
        assert_eq!(metrics.message_count, 30);
        // 30 messages over 30 seconds -> 60/min
        assert!((metrics.messages_per_minute - 60.0).abs() < 0.1);
        assert_eq!(metrics.messages_last_60s, 30);
    }

    #[test]
    fn metrics_recent_rate_needs_two_entries() {
        let mut stats = DeliveryStats::default();
        let subscribed_at = Utc::now();
        let now = subscribed_at + TimeDelta::seconds(10);

        let empty = stats.metrics("sub-1", subscribed_at, now);
        assert!((empty.recent_rate - 0.0).abs() < f64::EPSILON);

        stats.record(subscribed_at);
        let single = stats.metrics("sub-1", subscribed_at, now);
        assert!((single.recent_rate - 0.0).abs() < f64::EPSILON);

        stats.record(subscribed_at + TimeDelta::seconds(5));
        let double = stats.metrics("sub-1", subscribed_at, now);
        assert!(double.recent_rate > 0.0);
    }

    #[test]
    fn metrics_excludes_old_deliveries_from_window() {
        let mut stats = DeliveryStats::default();
        let subscribed_at = Utc::now();
        let now = subscribed_at + TimeDelta::seconds(120);

        stats.record(subscribed_at + TimeDelta::seconds(10));
        stats.record(subscribed_at + TimeDelta::seconds(90));

        let metrics = stats.metrics("sub-1", subscribed_at, now);
        assert_eq!(metrics.message_count, 2);
        assert_eq!(metrics.messages_last_60s, 1);
    }

    #[test]
    fn snapshot_reflects_record() {
        let record = Subscription {
            id: "sub-7".to_string(),
            kind: FeedKind::UserFills,
            params: params(&[("user", json!("0xABC"))]),
            request: json!({"type": "userFills", "user": "0xABC"}),
            connection_key: "user:0xabc".to_string(),
            connection: Some(ConnectionId(3)),
            callback: None,
            subscribed_at: Utc::now(),
            stats: DeliveryStats::default(),
        };

        let snapshot = record.snapshot();
        assert_eq!(snapshot.id, "sub-7");
        assert!(snapshot.alive);
        assert_eq!(snapshot.connection_class, ConnectionClass::UserGrouped);
        assert_eq!(record.principal(), Some("0xabc".to_string()));
    }

    mod properties {
        use proptest::prelude::*;
        use serde_json::json;

        use super::*;

        fn coin_strategy() -> impl Strategy<Value = String> {
            "[A-Z]{2,6}"
        }

        proptest! {
            #[test]
            fn key_generation_is_pure(coin in coin_strategy()) {
                let endpoints = endpoints();
                let p = params(&[("coin", json!(coin))]);
                let first = connection_key(FeedKind::L2Book, &p, &endpoints);
                let second = connection_key(FeedKind::L2Book, &p, &endpoints);
                prop_assert_eq!(first, second);
            }

            #[test]
            fn distinct_coins_never_collapse(a in coin_strategy(), b in coin_strategy()) {
                prop_assume!(a != b);
                let endpoints = endpoints();
                let key_a = connection_key(FeedKind::L2Book, &params(&[("coin", json!(a))]), &endpoints);
                let key_b = connection_key(FeedKind::L2Book, &params(&[("coin", json!(b))]), &endpoints);
                prop_assert_ne!(key_a, key_b);
            }

            #[test]
            fn message_count_is_monotonic(deliveries in 1usize..200) {
                let mut stats = DeliveryStats::default();
                let start = Utc::now();
                let mut previous = 0;
                for i in 0..deliveries {
                    stats.record(start + TimeDelta::milliseconds(i as i64));
                    prop_assert!(stats.message_count > previous);
                    previous = stats.message_count;
                }
                prop_assert_eq!(stats.message_count, deliveries as u64);
            }
        }
    }
}
