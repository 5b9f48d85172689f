//! Broker RPC client configuration (spec §4.3, §4.3.2).

use serde::{Deserialize, Serialize};

/// Heartbeat publisher settings (§4.3).
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub topic: String,
    pub interval_seconds: u64,
    pub payload: Option<serde_json::Value>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            topic: "heartbeat".to_string(),
            interval_seconds: 30,
            payload: None,
        }
    }
}

/// One relay broker session (§3 "Relay broker entry").
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RelayBrokerEntry {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub primary: bool,
    pub use_tls: bool,
}

/// One relay forwarding rule (§3 "Relay rule").
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RelayRule {
    pub source_topic: String,
    pub destination_topic: String,
    pub prefix: Option<String>,
    pub source_broker: usize,
    pub destination_broker: usize,
    pub bidirectional: bool,
}

/// Conditional multi-broker relay configuration (§4.3.2).
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    pub conditional_relay: bool,
    pub prefix: Option<String>,
    pub brokers: Vec<RelayBrokerEntry>,
    pub rules: Vec<RelayRule>,
}

/// Top-level broker RPC client configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BrokerConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub keepalive: u64,
    pub clean_session: bool,
    pub qos: u8,

    pub username: Option<String>,
    pub password: Option<String>,

    pub use_tls: bool,
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub tls_version: Option<String>,
    pub tls_insecure: bool,

    pub connect_timeout: u64,
    pub message_timeout: u64,

    pub auto_reconnect: bool,
    pub reconnect_delay_min: u64,
    pub reconnect_delay_max: u64,

    pub subscriptions: Vec<String>,
    pub publications: Vec<String>,

    pub base_prefix: String,
    pub service: String,
    pub request_suffix: String,
    pub response_suffix: String,
    pub notification_suffix: String,
    pub include_tid_in_path: bool,

    pub heartbeat: HeartbeatConfig,
    pub relay: RelayConfig,
}

impl BrokerConfig {
    /// Builds a config with every option at its documented default (§4.3),
    /// just the connection triple filled in.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            broker_host: host.into(),
            broker_port: port,
            client_id: client_id.into(),
            keepalive: crate::constants::DEFAULT_KEEPALIVE_SECS,
            clean_session: true,
            qos: crate::constants::DEFAULT_QOS,
            username: None,
            password: None,
            use_tls: false,
            ca_file: None,
            cert_file: None,
            key_file: None,
            tls_version: None,
            tls_insecure: false,
            connect_timeout: 10,
            message_timeout: 30,
            auto_reconnect: true,
            reconnect_delay_min: 1,
            reconnect_delay_max: 30,
            subscriptions: Vec::new(),
            publications: Vec::new(),
            base_prefix: "backend-datalink".to_string(),
            service: "gateway".to_string(),
            request_suffix: "request".to_string(),
            response_suffix: "response".to_string(),
            notification_suffix: "notification".to_string(),
            include_tid_in_path: true,
            heartbeat: HeartbeatConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 1883, "backend-datalink")
    }
}

/// Topic generation is a pure function of `(base, service, method, suffix,
/// tid)` (§8 round-trip law).
#[must_use]
pub fn topic(cfg: &BrokerConfig, method: &str, suffix: &str, tid: Option<&str>) -> String {
    match (cfg.include_tid_in_path, tid) {
        (true, Some(tid)) => format!(
            "{}/{}/{}/{}/{}",
            cfg.base_prefix, cfg.service, method, suffix, tid
        ),
        _ => format!("{}/{}/{}/{}", cfg.base_prefix, cfg.service, method, suffix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_generation_is_a_pure_function_of_its_inputs() {
        let cfg = BrokerConfig::new("h", 1883, "c");
        let a = topic(&cfg, "get_status", &cfg.request_suffix, Some("tid-1"));
        let b = topic(&cfg, "get_status", &cfg.request_suffix, Some("tid-1"));
        assert_eq!(a, b);
        assert_eq!(a, "backend-datalink/gateway/get_status/request/tid-1");
    }

    #[test]
    fn topic_omits_tid_when_disabled() {
        let mut cfg = BrokerConfig::new("h", 1883, "c");
        cfg.include_tid_in_path = false;
        let t = topic(&cfg, "get_status", &cfg.request_suffix, Some("tid-1"));
        assert_eq!(t, "backend-datalink/gateway/get_status/request");
    }
}
