//! Multiplexer Configuration Settings
//!
//! Configuration types for the stream multiplexer, loaded from environment
//! variables.

use std::time::Duration;

use crate::domain::feed::Endpoints;

/// Target network environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    /// Production network.
    #[default]
    Mainnet,
    /// Test network.
    Testnet,
}

impl Network {
    /// Parse network from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "testnet" => Self::Testnet,
            _ => Self::Mainnet,
        }
    }

    /// Get the network name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
        }
    }

    /// Get the real-time API WebSocket URL.
    #[must_use]
    pub const fn api_url(&self) -> &'static str {
        match self {
            Self::Mainnet => "wss://api.hyperliquid.xyz/ws",
            Self::Testnet => "wss://api.hyperliquid-testnet.xyz/ws",
        }
    }

    /// Get the explorer RPC WebSocket URL.
    #[must_use]
    pub const fn explorer_url(&self) -> &'static str {
        match self {
            Self::Mainnet => "wss://rpc.hyperliquid.xyz/ws",
            Self::Testnet => "wss://rpc.hyperliquid-testnet.xyz/ws",
        }
    }

    /// Resolve the endpoint pair descriptors route against.
    #[must_use]
    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            api: self.api_url().to_string(),
            explorer: self.explorer_url().to_string(),
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before considering a connection dead.
    pub heartbeat_timeout: Duration,
    /// Capacity of each connection's outbound frame queue.
    pub frame_capacity: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            frame_capacity: 64,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8082 }
    }
}

/// Complete multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Target network.
    pub network: Network,
    /// Server port settings.
    pub server: ServerSettings,
    /// WebSocket connection settings.
    pub websocket: WebSocketSettings,
    /// Prune subscriptions on unscoped transport errors instead of the
    /// legacy notify-only behavior.
    pub prune_on_unscoped_error: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            server: ServerSettings::default(),
            websocket: WebSocketSettings::default(),
            prune_on_unscoped_error: false,
        }
    }
}

impl MuxConfig {
    /// Create configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let network = std::env::var("HL_MUX_NETWORK")
            .map(|s| Network::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let server = ServerSettings {
            health_port: parse_env_u16("HL_MUX_HEALTH_PORT", ServerSettings::default().health_port),
        };

        let websocket = WebSocketSettings {
            heartbeat_interval: parse_env_duration_secs(
                "HL_MUX_HEARTBEAT_INTERVAL_SECS",
                WebSocketSettings::default().heartbeat_interval,
            ),
            heartbeat_timeout: parse_env_duration_secs(
                "HL_MUX_HEARTBEAT_TIMEOUT_SECS",
                WebSocketSettings::default().heartbeat_timeout,
            ),
            frame_capacity: parse_env_usize(
                "HL_MUX_FRAME_CAPACITY",
                WebSocketSettings::default().frame_capacity,
            ),
        };

        let prune_on_unscoped_error = std::env::var("HL_MUX_PRUNE_ON_UNSCOPED_ERROR")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Self {
            network,
            server,
            websocket,
            prune_on_unscoped_error,
        }
    }

    /// Resolve the endpoint pair for the configured network.
    #[must_use]
    pub fn endpoints(&self) -> Endpoints {
        self.network.endpoints()
    }
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}
