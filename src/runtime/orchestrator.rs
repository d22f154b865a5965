// src/runtime/orchestrator.rs
//! Connection orchestrator
//!
//! Drives one accepted connection from start to finish:
//!
//! 1. resolve the original destination (abort on failure)
//! 2. sniff the opening bytes for an HTTP request head
//! 3. evaluate the intercept policy against the rebuilt absolute URL
//! 4. run the passthrough tunnel or the HTTP interceptor, replaying the
//!    sniffed bytes first
//! 5. shut the client transport down, once, after every task spawned for
//!    the connection has finished

use crate::interception::destination::DestinationResolver;
use crate::interception::http_interceptor::HttpInterceptor;
use crate::interception::policy::InterceptConfig;
use crate::interception::request::{self, Sniffed};
use crate::interception::rewind::Rewind;
use crate::interception::tap::DebugTap;
use crate::interception::tunnel::PassthroughTunnel;
use crate::observability;
use crate::runtime::connection::ConnectionContext;
use crate::utils::config::{LimitSettings, ProxyConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Data path chosen for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Intercept,
    Passthrough,
}

/// Handles accepted connections; shared by every connection task
pub struct ConnectionHandler {
    resolver: Arc<dyn DestinationResolver>,
    rules: Arc<InterceptConfig>,
    limits: LimitSettings,
    tunnel: PassthroughTunnel,
    interceptor: HttpInterceptor,
}

impl ConnectionHandler {
    pub fn new(
        resolver: Arc<dyn DestinationResolver>,
        rules: Arc<InterceptConfig>,
        limits: LimitSettings,
        tap: Option<DebugTap>,
    ) -> Self {
        Self {
            resolver,
            rules,
            tunnel: PassthroughTunnel::new(limits.dial_timeout()),
            interceptor: HttpInterceptor::new(limits.clone(), tap),
            limits,
        }
    }

    /// Build a handler from settings, with the console tap if enabled
    pub fn from_config(
        config: &ProxyConfig,
        resolver: Arc<dyn DestinationResolver>,
        rules: Arc<InterceptConfig>,
    ) -> Self {
        let tap = config
            .tap
            .enabled
            .then(|| DebugTap::console(config.tap.capacity));
        Self::new(resolver, rules, config.limits.clone(), tap)
    }

    /// Pick the data path for what the client sent first
    ///
    /// Anything that is not a complete HTTP head with a known host is
    /// tunnelled.
    pub fn route(&self, sniffed: &Sniffed) -> Route {
        let url = match sniffed.head.as_ref().map(|head| head.absolute_target()) {
            Some(Ok(url)) => url.to_string(),
            _ => return Route::Passthrough,
        };

        if self.rules.should_intercept(&url) {
            Route::Intercept
        } else {
            Route::Passthrough
        }
    }

    /// Serve one accepted connection
    pub async fn handle(&self, id: u64, mut stream: TcpStream, peer: SocketAddr) {
        let destination = match self.resolver.resolve(&stream) {
            Ok(destination) => destination,
            Err(e) => {
                warn!(connection = id, peer = %peer, step = e.step(), "{}", e);
                observability::record_error(e.step());
                close(id, stream).await;
                return;
            }
        };
        let ctx = ConnectionContext::new(id, peer, destination);
        debug!(connection = id, peer = %peer, destination = %destination, "Accepted");

        let sniffed = match request::sniff(
            &mut stream,
            self.limits.sniff_timeout(),
            self.limits.max_header_bytes,
        )
        .await
        {
            Ok(sniffed) => sniffed,
            Err(e) => {
                ctx.report(&e);
                close(id, stream).await;
                return;
            }
        };

        let route = self.route(&sniffed);
        debug!(connection = id, route = ?route, sniffed = sniffed.bytes.len(), "Routing");

        let client = Rewind::new(sniffed.bytes, stream);
        let returned = match route {
            Route::Intercept => self.interceptor.intercept(&ctx, client).await,
            Route::Passthrough => self.tunnel.relay(&ctx, client).await,
        };

        if let Some(client) = returned {
            close(id, client.into_inner()).await;
        }
    }
}

async fn close(id: u64, mut stream: TcpStream) {
    if let Err(e) = stream.shutdown().await {
        debug!(connection = id, "Shutdown: {}", e);
    }
}
