//! Hyperliquid Stream Mux Binary
//!
//! Starts the feed subscription multiplexer daemon.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin hl-stream-mux
//! ```
//!
//! # Environment Variables
//!
//! ## Optional
//! - `HL_MUX_NETWORK`: mainnet | testnet (default: mainnet)
//! - `HL_MUX_COINS`: Comma-separated coins to stream trades and books for
//! - `HL_MUX_USER`: Account address to stream fills and order updates for
//! - `HL_MUX_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `HL_MUX_HEARTBEAT_INTERVAL_SECS`: Ping interval (default: 30)
//! - `HL_MUX_HEARTBEAT_TIMEOUT_SECS`: Pong timeout (default: 60)
//! - `HL_MUX_PRUNE_ON_UNSCOPED_ERROR`: Prune on unscoped errors (default: false)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: hl-stream-mux)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use hl_stream_mux::infrastructure::telemetry;
use hl_stream_mux::{
    Coordinator, CoordinatorConfig, EventCallback, FeedKind, FeedParams, HealthServer,
    HealthServerState, MuxConfig, TracingStore, WsTransport, init_metrics, verify_catalog,
};
use serde_json::{Value, json};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
#[allow(clippy::expect_used)]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Hyperliquid Stream Mux");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = MuxConfig::from_env();
    log_config(&config);

    // Refuse to start if explicit descriptor metadata and the legacy
    // classifier disagree for any shipped feed.
    verify_catalog(&config.endpoints()).map_err(anyhow::Error::new)?;

    let shutdown_token = CancellationToken::new();

    // Assemble the coordinator over the real transport
    let transport = Arc::new(WsTransport::new(config.websocket.clone()));
    let mut coordinator_config = CoordinatorConfig::new(config.endpoints());
    coordinator_config.prune_on_unscoped_error = config.prune_on_unscoped_error;
    let coordinator = Coordinator::spawn(coordinator_config, transport, Arc::new(TracingStore));

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        coordinator.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    subscribe_initial_feeds(&coordinator).await;

    tracing::info!("Stream mux ready");

    await_shutdown(shutdown_token).await;

    coordinator.shutdown();
    tracing::info!("Stream mux stopped");
    Ok(())
}

/// Subscribe the feeds named by the environment.
async fn subscribe_initial_feeds(coordinator: &Coordinator) {
    let log_delivery: EventCallback = Arc::new(|payload: &Value| {
        let channel = payload
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or("<unknown>");
        tracing::debug!(channel, "Delivery");
    });

    subscribe_or_log(
        coordinator,
        FeedKind::AllMids,
        FeedParams::new(),
        &log_delivery,
    )
    .await;

    if let Ok(coins) = std::env::var("HL_MUX_COINS") {
        for coin in coins.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            let mut params = FeedParams::new();
            params.insert("coin".to_string(), json!(coin));
            subscribe_or_log(coordinator, FeedKind::Trades, params.clone(), &log_delivery).await;
            subscribe_or_log(coordinator, FeedKind::L2Book, params, &log_delivery).await;
        }
    }

    if let Ok(user) = std::env::var("HL_MUX_USER") {
        let mut params = FeedParams::new();
        params.insert("user".to_string(), json!(user));
        subscribe_or_log(coordinator, FeedKind::UserFills, params.clone(), &log_delivery).await;
        subscribe_or_log(coordinator, FeedKind::OrderUpdates, params, &log_delivery).await;
    }
}

async fn subscribe_or_log(
    coordinator: &Coordinator,
    kind: FeedKind,
    params: FeedParams,
    callback: &EventCallback,
) {
    match coordinator
        .subscribe(kind, params, Some(Arc::clone(callback)))
        .await
    {
        Ok(id) => tracing::info!(feed = kind.request_label(), id = %id, "Initial subscription"),
        Err(e) => tracing::error!(feed = kind.request_label(), error = %e, "Initial subscribe failed"),
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &MuxConfig) {
    tracing::info!(
        network = config.network.as_str(),
        health_port = config.server.health_port,
        prune_on_unscoped_error = config.prune_on_unscoped_error,
        "Configuration loaded"
    );
    tracing::debug!(
        api_url = config.network.api_url(),
        explorer_url = config.network.explorer_url(),
        "WebSocket endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
