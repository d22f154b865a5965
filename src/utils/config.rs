// src/utils/config.rs
//! Proxy settings
//!
//! Settings are layered: built-in defaults, then an optional `cgproxy.toml`
//! (or the file named by `CGPROXY_CONFIG`), then `CGPROXY__SECTION__KEY`
//! environment variables. The intercept rule set lives in its own JSON file,
//! see [`crate::interception::policy`].

use crate::utils::errors::{ProxyError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Default port the proxy listens on
pub const DEFAULT_PROXY_PORT: u16 = 18000;

/// Environment variable naming the settings file
pub const CONFIG_PATH_ENV: &str = "CGPROXY_CONFIG";

/// Top-level proxy settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub server: ServerConfig,
    pub intercept: InterceptSettings,
    pub redirect: RedirectSettings,
    pub tap: TapSettings,
    pub limits: LimitSettings,
    pub observability: ObservabilityConfig,
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Loopback address to bind
    pub host: String,

    /// Port the redirected connections arrive on
    pub port: u16,

    /// How long in-flight connections may take to drain on shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PROXY_PORT,
            shutdown_grace_ms: 5_000,
        }
    }
}

/// Where the intercept rules are read from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptSettings {
    pub rules_path: String,
}

impl Default for InterceptSettings {
    fn default() -> Self {
        Self {
            rules_path: "interceptLinks.json".to_string(),
        }
    }
}

/// Kernel redirection (eBPF) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectSettings {
    /// Load and attach the redirection programs at startup
    pub enabled: bool,

    /// Compiled eBPF object holding the programs and the config map
    pub object_path: String,

    /// Control group the programs are attached to
    pub cgroup_path: String,

    /// Treat attach failures as fatal
    pub strict_attach: bool,
}

impl Default for RedirectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            object_path: "proxy.bpf.o".to_string(),
            cgroup_path: "/sys/fs/cgroup".to_string(),
            strict_attach: false,
        }
    }
}

/// Debug tap settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapSettings {
    pub enabled: bool,

    /// Chunks buffered between the primary reader and a tap
    pub capacity: usize,
}

impl Default for TapSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 16,
        }
    }
}

/// Timeouts and size limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub dial_timeout_ms: u64,

    /// Wait for the client's opening bytes before falling back to passthrough
    pub sniff_timeout_ms: u64,

    pub max_header_bytes: usize,

    /// Cap on intercepted request bodies; unset streams bodies of any size
    pub max_body_bytes: Option<u64>,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 5_000,
            sniff_timeout_ms: 500,
            max_header_bytes: 64 * 1024,
            max_body_bytes: None,
        }
    }
}

impl LimitSettings {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms)
    }
}

/// Logging and metrics settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter when `RUST_LOG` is unset
    pub log_level: String,

    /// `text` or `json`
    pub log_format: String,

    /// Prometheus exporter address, disabled when unset
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            metrics_addr: None,
        }
    }
}

impl ProxyConfig {
    /// Load settings from the default locations
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "cgproxy".to_string());
        Self::load_from(&path)
    }

    /// Load settings from `path` (extension optional) layered under the
    /// environment
    pub fn load_from(path: &str) -> Result<Self> {
        let config: ProxyConfig = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("CGPROXY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ProxyError::Settings(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Listener address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| ProxyError::Settings(format!("invalid listen address: {}", e)))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.server.shutdown_grace_ms)
    }

    /// Reject settings the proxy cannot run with
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.limits.dial_timeout_ms == 0 {
            return Err(ProxyError::Settings("dial timeout cannot be 0".into()));
        }
        if self.limits.sniff_timeout_ms == 0 {
            return Err(ProxyError::Settings("sniff timeout cannot be 0".into()));
        }
        if self.limits.max_header_bytes == 0 || self.limits.max_body_bytes == Some(0) {
            return Err(ProxyError::Settings("size limits cannot be 0".into()));
        }
        if self.tap.capacity == 0 {
            return Err(ProxyError::Settings("tap capacity cannot be 0".into()));
        }
        if !matches!(self.observability.log_format.as_str(), "text" | "json") {
            return Err(ProxyError::Settings(format!(
                "unknown log format: {}",
                self.observability.log_format
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.server.port, DEFAULT_PROXY_PORT);
        assert_eq!(config.listen_addr().unwrap().to_string(), "127.0.0.1:18000");
        assert_eq!(config.limits.dial_timeout(), Duration::from_secs(5));
        assert!(config.redirect.enabled);
        assert!(!config.redirect.strict_attach);
        assert_eq!(config.limits.max_body_bytes, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[server]\nport = 19000\n\n[tap]\nenabled = false\n\n[redirect]\nstrict_attach = true"
        )
        .unwrap();

        let config = ProxyConfig::load_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 19000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(!config.tap.enabled);
        assert!(config.redirect.strict_attach);
        assert_eq!(config.tap.capacity, 16);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let config = ProxyConfig::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, DEFAULT_PROXY_PORT);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = ProxyConfig::default();
        config.limits.dial_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ProxyError::Settings(_))));

        let mut config = ProxyConfig::default();
        config.limits.max_body_bytes = Some(0);
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::default();
        config.tap.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::default();
        config.observability.log_format = "xml".into();
        assert!(config.validate().is_err());
    }
}
