// src/utils/errors.rs
//! Error types for the proxy
//!
//! Every per-connection failure maps to one variant so that logs and metrics
//! can attribute it to the step that failed.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Intercept rules file missing, unreadable or malformed
    #[error("Failed to load intercept config: {0}")]
    ConfigLoad(String),

    /// Invalid proxy settings
    #[error("Invalid settings: {0}")]
    Settings(String),

    /// eBPF object load or kernel map update failed
    #[error("Redirection setup failed: {0}")]
    RedirectSetup(String),

    /// Attaching a redirection program to the cgroup failed
    #[error("Failed to attach redirection program: {0}")]
    RedirectAttach(String),

    /// Binding the proxy listener failed
    #[error("Failed to bind proxy listener: {0}")]
    Bind(String),

    /// Original destination could not be recovered from the socket
    #[error("Failed to resolve original destination: {0}")]
    DestinationResolution(String),

    /// Origin unreachable or connect timed out
    #[error("Failed to connect to origin: {0}")]
    Dial(String),

    /// Malformed client request
    #[error("Failed to parse HTTP request: {0}")]
    RequestParse(String),

    /// Absolute target could not be rebuilt
    #[error("Failed to rewrite request target: {0}")]
    RequestRewrite(String),

    /// Origin I/O failure while sending or receiving
    #[error("Failed to forward request: {0}")]
    Forward(String),

    /// Writing the response to the client failed
    #[error("Failed to write response to client: {0}")]
    ClientWrite(String),

    /// Debug tap observation failed
    #[error("Debug tap error: {0}")]
    Tap(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Name of the step that produced this error, used as a log field and
    /// metric label
    pub fn step(&self) -> &'static str {
        match self {
            ProxyError::ConfigLoad(_) => "config_load",
            ProxyError::Settings(_) => "settings",
            ProxyError::RedirectSetup(_) => "redirect_setup",
            ProxyError::RedirectAttach(_) => "redirect_attach",
            ProxyError::Bind(_) => "bind",
            ProxyError::DestinationResolution(_) => "resolve_destination",
            ProxyError::Dial(_) => "dial",
            ProxyError::RequestParse(_) => "read_request",
            ProxyError::RequestRewrite(_) => "fix_request",
            ProxyError::Forward(_) => "forward",
            ProxyError::ClientWrite(_) => "relay_response",
            ProxyError::Tap(_) => "tap",
            ProxyError::Io(_) => "io",
        }
    }
}
