//! Application-wide constants for backend-datalink.
//!
//! Centralizes magic numbers so the individual subsystem modules can read
//! like the spec they implement rather than a pile of literals.

use std::time::Duration;

// ============================================================================
// Worker pool
// ============================================================================

/// Poll interval `join(id, timeout)` uses while waiting for a worker to exit.
pub const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period between SIGTERM and SIGKILL when stopping a process-kind
/// worker.
pub const PROCESS_TERM_GRACE: Duration = Duration::from_millis(1000);

// ============================================================================
// WebSocket server
// ============================================================================

/// TCP accept backlog used by the WebSocket listener.
pub const ACCEPT_BACKLOG: u32 = 128;

/// Default categories returned by `get_dashboard_data` when the request
/// omits `categories`.
pub const DEFAULT_DASHBOARD_CATEGORIES: &[&str] =
    &["system", "ram", "swap", "network", "ultima_server", "signal"];

/// Server identifier embedded in echoed messages.
pub const SERVER_NAME: &str = "backend-datalink";

// ============================================================================
// Broker RPC client
// ============================================================================

/// Default MQTT keepalive, seconds.
pub const DEFAULT_KEEPALIVE_SECS: u64 = 60;

/// Default QoS for publishes when the config omits one.
pub const DEFAULT_QOS: u8 = 1;

/// Number of consecutive ~500ms readiness probes the heartbeat task must
/// observe before it starts publishing.
pub const HEARTBEAT_READY_PROBES: u32 = 5;

/// Interval between heartbeat readiness probes.
pub const HEARTBEAT_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Window within which a duplicate `(mid, topic)` PUBLISH is suppressed.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(2);

/// Ordered list of system CA directories probed when `use_tls` is set
/// without an explicit `ca_file`.
pub const SYSTEM_CA_CANDIDATES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/usr/local/etc/openssl/cert.pem",
    "/etc/ssl/cert.pem",
];

/// Maximum relay brokers per client (§4.3.2).
pub const MAX_RELAY_BROKERS: usize = 16;

/// Maximum relay rules per client (§4.3.2).
pub const MAX_RELAY_RULES: usize = 32;

// ============================================================================
// Request processor
// ============================================================================

/// Maximum inbound request payload size.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Per-worker join timeout during processor shutdown.
pub const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
