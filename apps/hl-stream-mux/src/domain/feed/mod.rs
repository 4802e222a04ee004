//! Feed Descriptors
//!
//! Static metadata and request building for every subscribable feed type.
//!
//! # Design
//!
//! The catalog is a closed enum: each `FeedKind` carries its wire label,
//! required/optional parameters, connection-sharing class, key fields, and
//! URL resolution. Adding a feed means adding a variant here — new feed
//! types must never rely on the legacy name-based classifier in [`legacy`].

pub mod legacy;

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

// =============================================================================
// Types
// =============================================================================

/// Parameters supplied with a subscribe request.
///
/// Ordered map so request building and key generation are deterministic.
pub type FeedParams = BTreeMap<String, Value>;

/// How subscriptions of a feed type share physical connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionClass {
    /// All subscriptions multiplex over one common connection per endpoint.
    Shared,
    /// Each distinct key-field combination gets its own connection.
    Dedicated,
    /// Subscriptions are grouped onto one connection per principal.
    UserGrouped,
}

impl ConnectionClass {
    /// Get the class name for logs and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Dedicated => "dedicated",
            Self::UserGrouped => "user_grouped",
        }
    }
}

/// WebSocket endpoints a descriptor can resolve against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Main real-time API endpoint.
    pub api: String,
    /// Explorer RPC endpoint (blocks and transactions).
    pub explorer: String,
}

// =============================================================================
// Feed Catalog
// =============================================================================

/// A subscribable feed type.
///
/// The closed catalog of everything the multiplexer knows how to subscribe
/// to. Market feeds ride the shared connection; order books are heavy enough
/// to warrant a dedicated connection per book; account feeds are grouped per
/// principal so one connection serves all of a user's channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    /// Mid prices for all coins.
    AllMids,
    /// Trade prints for one coin.
    Trades,
    /// Best bid/offer for one coin.
    Bbo,
    /// Candles for one coin and interval.
    Candle,
    /// Asset context (funding, open interest) for one coin.
    ActiveAssetCtx,
    /// Order book depth for one coin.
    L2Book,
    /// Account notifications.
    Notification,
    /// Order state changes for one account.
    OrderUpdates,
    /// Fills, liquidations, and funding events for one account.
    UserEvents,
    /// Fill history stream for one account.
    UserFills,
    /// Funding payments for one account.
    UserFundings,
    /// Non-funding ledger updates (deposits, transfers) for one account.
    UserNonFundingLedgerUpdates,
    /// New blocks from the explorer RPC.
    ExplorerBlock,
    /// New transactions from the explorer RPC.
    ExplorerTxs,
}

impl FeedKind {
    /// Get all shipped feed kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::AllMids,
            Self::Trades,
            Self::Bbo,
            Self::Candle,
            Self::ActiveAssetCtx,
            Self::L2Book,
            Self::Notification,
            Self::OrderUpdates,
            Self::UserEvents,
            Self::UserFills,
            Self::UserFundings,
            Self::UserNonFundingLedgerUpdates,
            Self::ExplorerBlock,
            Self::ExplorerTxs,
        ]
    }

    /// Get the wire-level request label (`"type"` in the subscription object).
    #[must_use]
    pub const fn request_label(self) -> &'static str {
        match self {
            Self::AllMids => "allMids",
            Self::Trades => "trades",
            Self::Bbo => "bbo",
            Self::Candle => "candle",
            Self::ActiveAssetCtx => "activeAssetCtx",
            Self::L2Book => "l2Book",
            Self::Notification => "notification",
            Self::OrderUpdates => "orderUpdates",
            Self::UserEvents => "userEvents",
            Self::UserFills => "userFills",
            Self::UserFundings => "userFundings",
            Self::UserNonFundingLedgerUpdates => "userNonFundingLedgerUpdates",
            Self::ExplorerBlock => "explorerBlock",
            Self::ExplorerTxs => "explorerTxs",
        }
    }

    /// Look up a feed kind by its wire label.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|kind| kind.request_label() == label)
    }

    /// Get the connection-sharing class.
    #[must_use]
    pub const fn connection_class(self) -> ConnectionClass {
        match self {
            Self::AllMids | Self::Trades | Self::Bbo | Self::Candle | Self::ActiveAssetCtx => {
                ConnectionClass::Shared
            }
            Self::L2Book | Self::ExplorerBlock | Self::ExplorerTxs => ConnectionClass::Dedicated,
            Self::Notification
            | Self::OrderUpdates
            | Self::UserEvents
            | Self::UserFills
            | Self::UserFundings
            | Self::UserNonFundingLedgerUpdates => ConnectionClass::UserGrouped,
        }
    }

    /// Get the parameters that must be present in a subscribe request.
    #[must_use]
    pub const fn required_params(self) -> &'static [&'static str] {
        match self {
            Self::AllMids | Self::ExplorerBlock | Self::ExplorerTxs => &[],
            Self::Trades | Self::Bbo | Self::ActiveAssetCtx | Self::L2Book => &["coin"],
            Self::Candle => &["coin", "interval"],
            Self::Notification
            | Self::OrderUpdates
            | Self::UserEvents
            | Self::UserFills
            | Self::UserFundings
            | Self::UserNonFundingLedgerUpdates => &["user"],
        }
    }

    /// Get the parameters that may optionally be present.
    #[must_use]
    pub const fn optional_params(self) -> &'static [&'static str] {
        match self {
            Self::AllMids => &["dex"],
            Self::L2Book => &["nSigFigs", "nLevels"],
            Self::UserFills => &["aggregateByTime"],
            _ => &[],
        }
    }

    /// Get the fields that isolate `dedicated` subscriptions from each other.
    #[must_use]
    pub const fn key_fields(self) -> &'static [&'static str] {
        match self {
            Self::L2Book => &["coin"],
            _ => &[],
        }
    }

    /// Resolve the target WebSocket URL for this feed.
    #[must_use]
    pub fn resolve_url(self, endpoints: &Endpoints) -> String {
        match self {
            Self::ExplorerBlock | Self::ExplorerTxs => endpoints.explorer.clone(),
            _ => endpoints.api.clone(),
        }
    }

    /// Whether delivered events are handed to the storage hook.
    #[must_use]
    pub const fn storage_enabled(self) -> bool {
        matches!(self, Self::UserFills | Self::OrderUpdates)
    }

    /// Normalize parameter encodings before validation.
    ///
    /// Order book precision parameters arrive as strings from some callers
    /// and are coerced to integers so the wire request and dedup both see
    /// one canonical encoding.
    pub fn normalize_params(self, params: &mut FeedParams) {
        if self == Self::L2Book {
            for field in ["nSigFigs", "nLevels"] {
                let coerced = params
                    .get(field)
                    .and_then(Value::as_str)
                    .and_then(|text| text.parse::<u64>().ok());
                if let Some(parsed) = coerced {
                    params.insert(field.to_string(), json!(parsed));
                }
            }
        }
    }

    /// Build the wire-level subscription object.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when a required parameter is missing or a
    /// parameter outside the declared set is supplied.
    pub fn build_request(self, params: &FeedParams) -> Result<Value, ValidationError> {
        for field in self.required_params() {
            if !params.contains_key(*field) {
                return Err(ValidationError::MissingParam {
                    feed: self.request_label(),
                    field,
                });
            }
        }

        let mut object = Map::new();
        object.insert("type".to_string(), json!(self.request_label()));

        for (name, value) in params {
            let known = self.required_params().contains(&name.as_str())
                || self.optional_params().contains(&name.as_str());
            if !known {
                return Err(ValidationError::UnknownParam {
                    feed: self.request_label(),
                    field: name.clone(),
                });
            }
            object.insert(name.clone(), value.clone());
        }

        Ok(Value::Object(object))
    }

    /// Extract storable events from a delivered payload.
    ///
    /// Account feeds deliver both snapshot envelopes with event lists and
    /// single streaming objects; both shapes flatten to individual events.
    #[must_use]
    pub fn extract_events(self, data: &Value) -> Vec<Value> {
        if self == Self::UserFills
            && let Some(fills) = data.get("fills").and_then(Value::as_array)
        {
            return fills.clone();
        }

        match data {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Subscribe request validation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A required parameter was not supplied.
    #[error("feed {feed} requires parameter {field}")]
    MissingParam {
        /// Wire label of the feed being subscribed.
        feed: &'static str,
        /// Name of the missing parameter.
        field: &'static str,
    },
    /// A parameter outside the declared set was supplied.
    #[error("feed {feed} does not accept parameter {field}")]
    UnknownParam {
        /// Wire label of the feed being subscribed.
        feed: &'static str,
        /// Name of the rejected parameter.
        field: String,
    },
}

// =============================================================================
// Tests
// =============================================================================
