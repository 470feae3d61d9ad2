//! Configuration parsing and management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::replay::Signature;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Where captured exchanges are stored
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Replay engine settings
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Injection scanner settings
    #[serde(default)]
    pub scanner: ScannerConfig,
}

/// Proxy-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address to bind the proxy server
    pub bind_address: String,

    /// Timeout for dialing a CONNECT target, in seconds
    pub connect_timeout_secs: u64,

    /// Timeout for an outbound plaintext call to produce a response head, and the
    /// longest gap allowed between response body frames, in seconds
    pub upstream_timeout_secs: u64,

    /// Per-direction cap on captured tunnel bytes; the tail of the stream is kept
    pub max_tunnel_capture_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            connect_timeout_secs: 10,
            upstream_timeout_secs: 30,
            max_tunnel_capture_bytes: 1024 * 1024,
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON-lines file holding captured exchanges. Unset keeps captures in memory only.
    pub path: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,

    /// Whether to log every proxied request at info level
    pub log_requests: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_requests: true,
        }
    }
}

/// Replay engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Total timeout for one replayed call, in seconds
    pub timeout_secs: u64,

    /// Optional HTTP proxy to send replays through (e.g. "http://127.0.0.1:8080")
    pub proxy: Option<String>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            proxy: None,
        }
    }
}

impl ReplayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Injection scanner configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Ordered payload/marker pairs tried against every parameter
    pub signatures: Vec<Signature>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            signatures: Signature::command_injection_defaults(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.proxy.connect_timeout_secs == 0 {
            return Err(Error::config("proxy.connect_timeout_secs must be greater than 0"));
        }
        if self.proxy.upstream_timeout_secs == 0 {
            return Err(Error::config("proxy.upstream_timeout_secs must be greater than 0"));
        }
        if self.replay.timeout_secs == 0 {
            return Err(Error::config("replay.timeout_secs must be greater than 0"));
        }

        for (i, sig) in self.scanner.signatures.iter().enumerate() {
            if sig.payload.is_empty() {
                return Err(Error::config(format!(
                    "Signature #{}: `payload` must not be empty",
                    i + 1
                )));
            }
            if sig.marker.is_empty() {
                return Err(Error::config(format!(
                    "Signature #{}: `marker` must not be empty",
                    i + 1
                )));
            }
        }

        Ok(())
    }

    /// Create a minimal configuration bound to the given address, storing in memory
    pub fn minimal(bind_address: String) -> Self {
        Self {
            proxy: ProxyConfig {
                bind_address,
                ..ProxyConfig::default()
            },
            ..Config::default()
        }
    }
}
