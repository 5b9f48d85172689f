//! Configuration file loading and validation.
//!
//! Loads the `-pkg_config <path>` JSON document (§6) and validates it
//! against the exact rules spec.md lays out. Validation failures are
//! reported eagerly at load time rather than discovered mid-run.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration document.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct GatewayConfig {
    /// WebSocket fan-out server settings.
    #[serde(default)]
    pub websocket: WebSocketConfig,
    /// Embedded store settings.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Host-metrics collection settings.
    #[serde(default)]
    pub system_data: SystemDataConfig,
    /// Broker RPC client settings. Not named among spec.md §6's three
    /// top-level objects but required to actually connect anywhere;
    /// treated as part of the same document for a single `-pkg_config`.
    #[serde(default)]
    pub broker: crate::broker::BrokerConfig,
}

/// WebSocket server configuration (§4.2).
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Interface to bind. `0.0.0.0` means all IPv4.
    pub host: String,
    /// Port, 1..65535.
    pub port: u16,
    /// Advisory connection cap, 1..10000.
    pub max_connections: usize,
    /// Per-send timeout in milliseconds, 100..300000.
    pub timeout_ms: u64,
    /// Whether the server emits its own log lines.
    pub enable_logging: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            max_connections: 1000,
            timeout_ms: 5000,
            enable_logging: true,
        }
    }
}

impl WebSocketConfig {
    /// Validate against the exact bounds in spec.md §6.
    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("websocket.host must not be empty");
        }
        if self.port == 0 {
            bail!("websocket.port must be in 1..=65535, got 0");
        }
        if !(1..=10000).contains(&self.max_connections) {
            bail!(
                "websocket.max_connections must be in 1..=10000, got {}",
                self.max_connections
            );
        }
        if !(100..=300_000).contains(&self.timeout_ms) {
            bail!(
                "websocket.timeout_ms must be in 100..=300000, got {}",
                self.timeout_ms
            );
        }
        Ok(())
    }
}

/// Embedded store configuration (§6).
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the store file.
    pub path: String,
    /// Whether the store is enabled at all.
    pub enabled: bool,
    /// Whether to append connection lifecycle events.
    pub log_connections: bool,
    /// Whether to append inbound/outbound message rows.
    pub log_messages: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "backend-datalink.db".to_string(),
            enabled: true,
            log_connections: true,
            log_messages: false,
        }
    }
}

/// Host-metrics collection configuration (§6). The collector itself is an
/// external collaborator (§1); this struct only captures the knobs that
/// shape the push interface into the gateway.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SystemDataConfig {
    /// Whether the collector feeder is enabled.
    pub enabled: bool,
    /// Seconds between samples, >= 1.
    pub poll_interval_seconds: u64,
    /// Seconds between store flushes, >= 1.
    pub database_update_interval_seconds: u64,
    /// Whether to log each sample.
    pub log_samples: bool,
    /// Seconds between log lines when `log_samples` is set, > 0.
    pub log_interval: u64,
}

impl Default for SystemDataConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 5,
            database_update_interval_seconds: 30,
            log_samples: false,
            log_interval: 60,
        }
    }
}

impl SystemDataConfig {
    fn validate(&self) -> Result<()> {
        if self.poll_interval_seconds < 1 {
            bail!("system_data.poll_interval_seconds must be >= 1");
        }
        if self.database_update_interval_seconds < 1 {
            bail!("system_data.database_update_interval_seconds must be >= 1");
        }
        if self.log_samples && self.log_interval == 0 {
            bail!("system_data.log_interval must be > 0 when log_samples is set");
        }
        Ok(())
    }
}

impl GatewayConfig {
    /// Load and validate a configuration document from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails any of the validation rules in spec.md §6.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section. Called automatically by [`Self::load`]; also
    /// exposed for tests that construct a config in memory.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first rule violated.
    pub fn validate(&self) -> Result<()> {
        self.websocket.validate()?;
        self.system_data.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(json.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_valid_config() {
        let f = write_config(
            r#"{"websocket":{"host":"0.0.0.0","port":9000,"max_connections":50,"timeout_ms":1000,"enable_logging":true}}"#,
        );
        let cfg = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(cfg.websocket.port, 9000);
        assert_eq!(cfg.websocket.max_connections, 50);
    }

    #[test]
    fn rejects_port_zero() {
        let f = write_config(r#"{"websocket":{"port":0}}"#);
        assert!(GatewayConfig::load(f.path()).is_err());
    }

    #[test]
    fn rejects_max_connections_over_cap() {
        let mut cfg = GatewayConfig::default();
        cfg.websocket.max_connections = 10001;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_timeout_out_of_range() {
        let mut cfg = GatewayConfig::default();
        cfg.websocket.timeout_ms = 50;
        assert!(cfg.validate().is_err());

        let mut cfg = GatewayConfig::default();
        cfg.websocket.timeout_ms = 300_001;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_host() {
        let mut cfg = GatewayConfig::default();
        cfg.websocket.host = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(GatewayConfig::default().validate().is_ok());
    }
}
