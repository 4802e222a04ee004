#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Hyperliquid Stream Mux - Feed Subscription Multiplexer
//!
//! Maintains a minimal set of WebSocket connections to the Hyperliquid
//! real-time API and multiplexes parameterized feed subscriptions over
//! them: equivalent subscribe requests are deduplicated, inbound payloads
//! are fanned out to the right listeners, and connection failures stay
//! contained to the subscriptions they served.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Routing decisions with no transport dependencies
//!   - `feed`: The static catalog of subscribable feed types
//!   - `subscription`: Records, connection keying, delivery metrics
//!
//! - **Application**: Port definitions
//!   - `ports`: Transport and event-store contracts
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `coordinator`: The serialized multiplexing core
//!   - `registry`: Concurrent-read subscription index
//!   - `ws`: tokio-tungstenite transport with liveness supervision
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! caller ──subscribe──► Coordinator ──key──► Connection pool ──► upstream WS
//!                           │                      │
//!                           ◄──inbound/error/closed┘
//!                           ├──► callbacks (sync fan-out)
//!                           └──► EventStore (fire-and-forget)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Routing decisions with no transport dependencies.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::feed::{
    ConnectionClass, Endpoints, FeedKind, FeedParams, ValidationError,
    legacy::{CatalogMismatch, verify_catalog},
};
pub use domain::subscription::{
    ConnectionId, DeliveryStats, EventCallback, SubscriptionId, SubscriptionMetrics,
    SubscriptionSnapshot, connection_key, params_equivalent,
};

// Ports
pub use application::ports::{
    ConnectionEvent, ConnectionHandle, EventStore, NullStore, TracingStore, Transport,
    TransportError, WireFrame,
};

// Coordinator
pub use infrastructure::coordinator::{
    ConnectionInfo, Coordinator, CoordinatorConfig, LookupError, SubscribeError,
};

// Lookup index
pub use infrastructure::registry::SubscriptionIndex;

// Infrastructure config
pub use infrastructure::config::{MuxConfig, Network, ServerSettings, WebSocketSettings};

// WebSocket transport
pub use infrastructure::ws::WsTransport;

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
