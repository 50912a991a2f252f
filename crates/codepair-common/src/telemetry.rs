//! Telemetry for codepair services.
//!
//! Provides:
//! - Prometheus metrics with a `/metrics` endpoint
//! - Compact console tracing filtered by `RUST_LOG`
//!
//! # Usage
//!
//! ```ignore
//! use codepair_common::telemetry::{self, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     telemetry::init(TelemetryConfig::from_env("codepair-sync-server"));
//!
//!     let app = Router::new()
//!         .route("/metrics", get(|| async { telemetry::render() }));
//!
//!     metrics::counter!("codepair_frames_relayed_total").increment(1);
//!     tracing::info!("server started");
//! }
//! ```

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for log context (e.g., "codepair-sync-server")
    pub service_name: String,
    /// Console log level when `RUST_LOG` is unset (INFO, DEBUG in debug builds)
    pub console_level: Level,
    /// Include the module target in each line
    pub with_target: bool,
}

impl TelemetryConfig {
    /// Defaults for a service. `RUST_LOG` still overrides the level at init.
    pub fn from_env(service_name: impl Into<String>) -> Self {
        let console_level = if cfg!(debug_assertions) {
            Level::DEBUG
        } else {
            Level::INFO
        };

        Self {
            service_name: service_name.into(),
            console_level,
            with_target: std::env::var("CODEPAIR_LOG_TARGETS")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
        }
    }
}

/// Initialize telemetry (metrics + tracing). Call once at startup.
pub fn init(config: TelemetryConfig) {
    init_metrics();
    init_tracing(&config);
}

/// Initialize just the prometheus metrics recorder.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install prometheus recorder")
    })
}

fn init_tracing(config: &TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.console_level.as_str().to_lowercase()));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .with_filter(env_filter);

    if tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .is_err()
    {
        // A subscriber is already set (tests, embedding); keep it.
        return;
    }

    tracing::debug!(service = %config.service_name, "telemetry initialized");
}

/// Get the prometheus handle.
pub fn handle() -> &'static PrometheusHandle {
    init_metrics()
}

/// Render metrics in prometheus text format.
pub fn render() -> String {
    handle().render()
}

pub use metrics::{counter, gauge, histogram};
