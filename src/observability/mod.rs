// src/observability/mod.rs
//! Logging and metrics
//!
//! - **Tracing**: `tracing-subscriber` with an `EnvFilter`; `RUST_LOG`
//!   overrides the configured level. Text or JSON output.
//! - **Metrics**: counters exported through a Prometheus listener when an
//!   address is configured.

use crate::utils::config::ObservabilityConfig;
use crate::utils::errors::{ProxyError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Connections handled, labelled by `path` (`intercept` or `passthrough`)
pub const CONNECTIONS_TOTAL: &str = "cgproxy_connections_total";

/// Per-connection failures, labelled by `step`
pub const CONNECTION_ERRORS_TOTAL: &str = "cgproxy_connection_errors_total";

/// Debug tap failures
pub const TAP_ERRORS_TOTAL: &str = "cgproxy_tap_errors_total";

/// Install the global tracing subscriber
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| ProxyError::Settings(format!("invalid log level: {}", e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if config.log_format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ProxyError::Settings(format!("tracing already initialised: {}", e)))
}

/// Install the Prometheus exporter (if configured) and describe the
/// counters the proxy emits
pub fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    if let Some(addr) = addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| ProxyError::Settings(format!("metrics exporter: {}", e)))?;
        info!("Prometheus exporter listening on {}", addr);
    }

    metrics::describe_counter!(CONNECTIONS_TOTAL, "Connections handled, by data path");
    metrics::describe_counter!(
        CONNECTION_ERRORS_TOTAL,
        "Connections aborted, by failing step"
    );
    metrics::describe_counter!(TAP_ERRORS_TOTAL, "Debug tap observation failures");

    Ok(())
}

/// Count a connection routed down `path`
pub fn record_connection(path: &'static str) {
    metrics::counter!(CONNECTIONS_TOTAL, "path" => path).increment(1);
}

/// Count a connection aborted at `step`
pub fn record_error(step: &'static str) {
    metrics::counter!(CONNECTION_ERRORS_TOTAL, "step" => step).increment(1);
}

pub fn record_tap_error() {
    metrics::counter!(TAP_ERRORS_TOTAL).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_exporter() {
        // No recorder installed: describing and counting are no-ops
        assert!(init_metrics(None).is_ok());
        record_connection("passthrough");
        record_error("dial");
        record_tap_error();
    }
}
