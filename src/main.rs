// src/main.rs
//! cgproxy
//!
//! Transparent proxy for cgroup-redirected TCP connections with selective
//! HTTP interception.

use anyhow::{Context, Result};
use cgproxy::interception::destination::SockOptResolver;
use cgproxy::interception::policy::InterceptConfig;
use cgproxy::observability::{init_metrics, init_tracing};
use cgproxy::redirect::ControlPlane;
use cgproxy::runtime::orchestrator::ConnectionHandler;
use cgproxy::runtime::server::{self, ProxyServer};
use cgproxy::utils::config::ProxyConfig;
use cgproxy::BuildInfo;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Settings first: they carry the log level and format
    let config = ProxyConfig::load().context("loading settings")?;

    init_tracing(&config.observability)?;
    init_metrics(config.observability.metrics_addr)?;

    let build = BuildInfo::current();
    info!(
        "Starting cgproxy v{} ({}, built {})",
        build.version, build.git_hash, build.build_timestamp
    );
    info!("Configuration loaded: {:?}", config);

    let rules = Arc::new(InterceptConfig::load_or_default(&config.intercept.rules_path));

    let addr = config.listen_addr()?;
    let listener = server::bind(addr).await?;
    let port = listener.local_addr().context("reading listener address")?.port();

    // Kept alive for the lifetime of the process; dropping detaches the programs
    let _control_plane = if config.redirect.enabled {
        let plane = ControlPlane::establish(&config.redirect, port)?;
        info!(
            "Redirection active for {} (pid {}), programs: {:?}",
            config.redirect.cgroup_path,
            plane.record().proxy_pid,
            plane.attached()
        );
        Some(plane)
    } else {
        warn!("Kernel redirection disabled; expecting connections redirected by other means");
        None
    };

    let resolver = Arc::new(SockOptResolver::new());
    let handler = ConnectionHandler::from_config(&config, resolver, rules);
    let proxy = ProxyServer::new(handler, config.shutdown_grace());

    // Graceful shutdown handler
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal, cleaning up..."),
            Err(e) => {
                error!("Failed to listen for CTRL+C: {}", e);
                return;
            }
        }
        signal.cancel();
    });

    proxy.serve(listener, shutdown).await;
    info!("Proxy stopped gracefully");
    Ok(())
}
