// src/lib.rs
//! cgproxy library
//!
//! A transparent TCP proxy fed by cgroup eBPF redirection. Every outbound
//! IPv4 connection of the redirected processes lands on the proxy, which
//! recovers the original destination and either tunnels the bytes untouched
//! or, for HTTP requests matching the intercept rules, parses and re-issues
//! the request while mirroring both directions to a debug tap.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **redirect**: loads and attaches the kernel redirection programs
//! - **runtime**: accept loop and per-connection orchestration
//! - **interception**: destination lookup, policy, tunnel, HTTP interceptor
//!   and debug taps
//! - **observability**: tracing and metrics setup
//! - **utils**: settings and error types

// Public module exports
pub mod interception;
pub mod observability;
pub mod redirect;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use interception::policy::InterceptConfig;
pub use runtime::orchestrator::ConnectionHandler;
pub use runtime::server::ProxyServer;
pub use utils::config::ProxyConfig;
pub use utils::errors::{ProxyError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Proxy build information
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert_eq!(info.version, VERSION);
        assert!(!info.git_hash.is_empty());
        assert!(!info.rustc_version.is_empty());
    }
}
