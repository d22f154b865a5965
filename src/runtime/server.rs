// src/runtime/server.rs
//! Accept loop
//!
//! One task per accepted connection, all on a single `TaskTracker` so that
//! shutdown can drain them. A panic inside a connection task is caught and
//! logged; the listener and the other connections keep running.

use crate::observability;
use crate::runtime::connection::ConnectionIds;
use crate::runtime::orchestrator::ConnectionHandler;
use crate::utils::errors::{ProxyError, Result};
use futures::FutureExt;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Pause after a failed accept (e.g. file descriptor exhaustion)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the proxy listener
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Bind(format!("{}: {}", addr, e)))
}

/// The proxy's accept loop
pub struct ProxyServer {
    handler: Arc<ConnectionHandler>,
    ids: ConnectionIds,
    shutdown_grace: Duration,
}

impl ProxyServer {
    pub fn new(handler: ConnectionHandler, shutdown_grace: Duration) -> Self {
        Self {
            handler: Arc::new(handler),
            ids: ConnectionIds::new(),
            shutdown_grace,
        }
    }

    /// Accept connections until `shutdown` fires, then drain
    ///
    /// In-flight connections get up to the shutdown grace period to finish;
    /// whatever is still running afterwards is abandoned.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();

        if let Ok(addr) = listener.local_addr() {
            info!("Proxy listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let id = self.ids.next();
                        let handler = Arc::clone(&self.handler);
                        tracker.spawn(async move {
                            let handled = AssertUnwindSafe(handler.handle(id, stream, peer))
                                .catch_unwind()
                                .await;
                            if let Err(panic) = handled {
                                error!(
                                    connection = id,
                                    "Connection task panicked: {}",
                                    panic_message(panic.as_ref())
                                );
                                observability::record_error("panic");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        tracker.close();
        info!(in_flight = tracker.len(), "Stopped accepting, draining connections");

        if tokio::time::timeout(self.shutdown_grace, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = tracker.len(),
                "Shutdown grace period elapsed with connections still open"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
