//! Tracing and Span Export
//!
//! Installs the global `tracing` subscriber for the daemon: a fmt layer
//! filtered through `RUST_LOG`, plus an OTLP span exporter for
//! OpenObserve or any OTLP-compatible collector.
//!
//! # Environment Variables
//!
//! - `OTEL_ENABLED`: set to "false" to skip span export (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: collector endpoint (default: http://localhost:4318)
//! - `OTEL_SERVICE_NAME`: service name on exported spans (default: hl-stream-mux)

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Service name for OpenTelemetry traces.
const DEFAULT_SERVICE_NAME: &str = "hl-stream-mux";

/// Default OTLP endpoint.
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4318";

/// Filter applied when `RUST_LOG` is unset.
const DEFAULT_DIRECTIVES: &str =
    "info,hl_stream_mux=info,tokio_tungstenite=warn,tungstenite=warn,hyper=warn";

/// Span-export settings, read once at startup.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Export spans over OTLP.
    pub enabled: bool,
    /// OTLP collector endpoint.
    pub otlp_endpoint: String,
    /// Service name attached to exported spans.
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read settings from the `OTEL_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let enabled =
            std::env::var("OTEL_ENABLED").map_or(true, |v| !v.eq_ignore_ascii_case("false"));
        let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_OTLP_ENDPOINT.to_string());
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string());

        Self {
            enabled,
            otlp_endpoint,
            service_name,
        }
    }
}

/// Flushes buffered spans when dropped.
///
/// Keep the guard alive for the lifetime of the program; dropping it shuts
/// the tracer provider down and drains the batch exporter.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Tracer provider shutdown failed: {e}");
        }
    }
}

/// Install the global subscriber using `OTEL_*` settings from the
/// environment.
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_config(TelemetryConfig::from_env())
}

/// Install the global subscriber with explicit settings.
///
/// An OTLP exporter that fails to build downgrades to log-only output
/// instead of aborting startup.
#[must_use]
pub fn init_with_config(config: TelemetryConfig) -> TelemetryGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    let provider = if config.enabled {
        match build_provider(&config) {
            Ok(provider) => Some(provider),
            Err(e) => {
                eprintln!("OTLP exporter unavailable, logging only: {e}");
                None
            }
        }
    } else {
        None
    };

    if let Some(provider) = &provider {
        let tracer = provider.tracer(config.service_name);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
    }

    TelemetryGuard { provider }
}

fn build_provider(
    config: &TelemetryConfig,
) -> Result<SdkTracerProvider, Box<dyn std::error::Error + Send + Sync>> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build())
}

// =============================================================================
// Tests
// =============================================================================
