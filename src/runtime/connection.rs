// src/runtime/connection.rs
//! Per-connection identity

use crate::interception::destination::OriginalDestination;
use crate::observability;
use crate::utils::errors::ProxyError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// What the proxy knows about one accepted connection
///
/// The transport itself travels next to this value and stays owned by the
/// orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionContext {
    pub id: u64,
    pub peer: SocketAddr,
    pub destination: OriginalDestination,
}

impl ConnectionContext {
    pub fn new(id: u64, peer: SocketAddr, destination: OriginalDestination) -> Self {
        Self {
            id,
            peer,
            destination,
        }
    }

    /// Log a failure against this connection and count it by step
    pub fn report(&self, err: &ProxyError) {
        warn!(
            connection = self.id,
            step = err.step(),
            peer = %self.peer,
            destination = %self.destination,
            "{}",
            err
        );
        observability::record_error(err.step());
    }
}

/// Monotonic connection id source, starting at 1
#[derive(Debug)]
pub struct ConnectionIds {
    next: AtomicU64,
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_start_at_one() {
        let ids = ConnectionIds::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let ids = Arc::new(ConnectionIds::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..250).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
