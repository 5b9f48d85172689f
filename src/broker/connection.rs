//! Broker session state machine and call plumbing (spec §4.3), grounded on
//! `rpc_client.h`'s `RpcClient` (start/stop/isConnected/setMessageHandler)
//! and the teacher's `broker/mod.rs` ASCII-lifecycle documentation style.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde_json::Value;
use uuid::Uuid;

use super::config::{topic, BrokerConfig};
use super::dedup::Dedup;
use super::error::{BrokerError, Result};
use super::pending::PendingTable;
use super::relay::{drain_session, RelayClient};
use crate::constants::{DEDUP_WINDOW, HEARTBEAT_PROBE_INTERVAL, HEARTBEAT_READY_PROBES, SYSTEM_CA_CANDIDATES};

/// Connection state machine (§4.3):
/// ```text
/// disconnected → connecting → connected
///           ↘           ↙↘
///           error     reconnecting → connecting → …
/// connected → disconnected (graceful) | error (unexpected)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Connect/reconnect/publish counters (§4.3 supplement, mirrors
/// `direct_client_statistics_t` from the original source).
#[derive(Default)]
pub struct Statistics {
    pub connects: AtomicU64,
    pub reconnects: AtomicU64,
    pub publishes: AtomicU64,
    pub publish_failures: AtomicU64,
    pub messages_received: AtomicU64,
}

type StatusCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;
type MessageHandler = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// A single durable session to a publish/subscribe broker, with
/// topic-pair request/response correlation and optional relay.
pub struct BrokerClient {
    config: BrokerConfig,
    client: AsyncClient,
    state: RwLock<ConnectionState>,
    status_callback: Mutex<Option<StatusCallback>>,
    message_handler: Mutex<Option<MessageHandler>>,
    pending: Arc<PendingTable>,
    dedup: Dedup,
    stats: Statistics,
    heartbeat_ready_probes: AtomicU64,
    heartbeat_active: AtomicBool,
    shutting_down: AtomicBool,
    relay: Option<Arc<RelayClient>>,
    relay_eventloops: Mutex<Option<Vec<rumqttc::EventLoop>>>,
}

impl BrokerClient {
    /// Builds the client and its `rumqttc` session (not yet connected).
    /// TLS, when `use_tls` is set without an explicit `ca_file`, probes
    /// [`SYSTEM_CA_CANDIDATES`] in order and uses the first that exists
    /// (§4.3 TLS options).
    pub fn new(config: BrokerConfig) -> Result<(Self, rumqttc::EventLoop)> {
        let mut opts = MqttOptions::new(
            config.client_id.clone(),
            config.broker_host.clone(),
            config.broker_port,
        );
        opts.set_keep_alive(Duration::from_secs(config.keepalive));
        opts.set_clean_session(config.clean_session);
        if let (Some(u), Some(p)) = (&config.username, &config.password) {
            opts.set_credentials(u.clone(), p.clone());
        }

        if config.use_tls {
            let ca_path = match &config.ca_file {
                Some(path) => Some(path.clone()),
                None => SYSTEM_CA_CANDIDATES
                    .iter()
                    .find(|p| Path::new(p).exists())
                    .map(|s| (*s).to_string()),
            };
            let ca = ca_path
                .and_then(|p| std::fs::read(p).ok())
                .ok_or_else(|| BrokerError::TlsInit("no usable CA certificate found".into()))?;
            opts.set_transport(Transport::tls_with_config(
                rumqttc::TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth: None,
                },
            ));
        }

        let (relay, relay_eventloops) = if config.relay.enabled {
            let (relay, eventloops) = RelayClient::new(&config.relay)?;
            (Some(Arc::new(relay)), Some(eventloops))
        } else {
            (None, None)
        };

        let (client, eventloop) = AsyncClient::new(opts, 128);

        Ok((
            Self {
                config,
                client,
                state: RwLock::new(ConnectionState::Disconnected),
                status_callback: Mutex::new(None),
                message_handler: Mutex::new(None),
                pending: Arc::new(PendingTable::default()),
                dedup: Dedup::new(DEDUP_WINDOW),
                stats: Statistics::default(),
                heartbeat_ready_probes: AtomicU64::new(0),
                heartbeat_active: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                relay,
                relay_eventloops: Mutex::new(relay_eventloops),
            },
            eventloop,
        ))
    }

    /// Takes the relay broker sessions' event loops (one per configured
    /// relay broker) for the caller to drive via
    /// [`Self::spawn_relay_drains`]. Returns `None` if relay isn't
    /// configured or this has already been called.
    pub fn take_relay_eventloops(&self) -> Option<Vec<rumqttc::EventLoop>> {
        self.relay_eventloops.lock().unwrap().take()
    }

    pub fn set_status_callback(&self, cb: impl Fn(ConnectionState) + Send + Sync + 'static) {
        *self.status_callback.lock().unwrap() = Some(Box::new(cb));
    }

    /// Installs the raw message handler, safe against in-flight deliveries
    /// (§5 "handler swaps are safe against in-flight deliveries").
    pub fn set_message_handler(&self, handler: impl Fn(&str, &[u8]) + Send + Sync + 'static) {
        *self.message_handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Test-only seam: forces the connection state without a real broker
    /// round trip, so dependents (e.g. the request processor) can exercise
    /// their publish path deterministically.
    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ConnectionState) {
        self.set_state(state);
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.write().unwrap() = next;
        if let Some(cb) = self.status_callback.lock().unwrap().as_ref() {
            cb(next);
        }
        if next != ConnectionState::Connected {
            // Stop publishing into a dead socket (§4.3 "the heartbeat task
            // is stopped to avoid publish-on-dead-socket loops").
            self.heartbeat_active.store(false, Ordering::SeqCst);
        }
    }

    /// `start()`: connects, auto-subscribes the configured topic list, and
    /// starts the relay (if configured). The caller is expected to drive
    /// `eventloop.poll()` on a dedicated task and feed `Event`s into
    /// [`Self::handle_event`].
    pub async fn start(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        for sub in &self.config.subscriptions {
            self.client
                .subscribe(sub, qos_from(self.config.qos))
                .await
                .map_err(|e| BrokerError::PublishFailed(e.to_string()))?;
        }
        if let Some(relay) = &self.relay {
            relay.connect_primary_brokers().await;
        }
        Ok(())
    }

    /// Feeds one `rumqttc::Event` from the caller's poll loop into the
    /// client's state machine and dispatch tables.
    pub async fn handle_event(&self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                self.stats.connects.fetch_add(1, Ordering::SeqCst);
                self.set_state(ConnectionState::Connected);
            }
            Event::Incoming(Packet::Disconnect) => {
                self.set_state(ConnectionState::Disconnected);
            }
            Event::Incoming(Packet::Publish(p)) => {
                self.stats.messages_received.fetch_add(1, Ordering::SeqCst);
                if p.qos != rumqttc::QoS::AtMostOnce && self.dedup.is_duplicate(p.pkid, &p.topic) {
                    return;
                }
                self.dispatch_response(&p.topic, &p.payload);
                if let Some(handler) = self.message_handler.lock().unwrap().as_ref() {
                    handler(&p.topic, &p.payload);
                }
            }
            _ => {}
        }
    }

    /// Feeds an `eventloop.poll()` error from the caller's drain loop into
    /// the state machine (§4.3 "connected → error (unexpected)"). A dropped
    /// socket surfaces here, not through `handle_event`, since `rumqttc`
    /// reports it as an `Err` from `poll()` rather than an incoming packet.
    /// Transitions to `Reconnecting` when `auto_reconnect` is configured
    /// (the broker library retries within the configured bounds) or
    /// `Error` otherwise, stopping the heartbeat either way (`set_state`).
    pub fn handle_poll_error(&self) {
        let next = if self.config.auto_reconnect {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Error
        };
        self.set_state(next);
    }

    /// Matches an incoming response by its embedded transaction ID
    /// regardless of the topic it arrived on (O(1), §5 ordering
    /// guarantees).
    fn dispatch_response(&self, _response_topic: &str, payload: &[u8]) {
        let Ok(value) = serde_json::from_slice::<Value>(payload) else {
            return;
        };
        let Some(tid) = value
            .get("transaction_id")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return;
        };
        self.pending.complete(&tid, Ok(value));
    }

    /// Builds the request JSON, registers a pending entry, and publishes
    /// (§4.3 `call_async` steps 1-3).
    pub async fn call_async(
        &self,
        method: &str,
        service: &str,
        params: Value,
        authority: &str,
        timeout_ms: u64,
        callback: impl FnOnce(Result<Value>) + Send + 'static,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let tid = generate_transaction_id();
        let request = serde_json::json!({
            "method": method,
            "service": service,
            "transaction_id": tid,
            "authority": authority,
            "timeout_ms": timeout_ms,
            "params": params,
        });
        let request_topic = topic(&self.config, method, &self.config.request_suffix, Some(&tid));
        // Response subscription is assumed already in place via the
        // configured subscription list, or added by the caller (§4.3 step 2).

        self.pending.insert(
            tid.clone(),
            Duration::from_millis(timeout_ms),
            Box::new(move |r| callback(r.map_err(Into::into))),
        );

        let body = serde_json::to_vec(&request).unwrap_or_default();
        match self
            .client
            .publish(request_topic, qos_from(self.config.qos), false, body)
            .await
        {
            Ok(()) => {
                self.stats.publishes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.pending.remove(&tid);
                self.stats.publish_failures.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::PublishFailed(e.to_string()))
            }
        }
    }

    /// Publishes an already-built JSON-RPC response envelope on
    /// `response_topic` (used by the Request Processor, §4.4 step 4).
    pub async fn publish_response(&self, response_topic: &str, envelope: &Value) -> Result<()> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let body = serde_json::to_vec(envelope).unwrap_or_default();
        self.client
            .publish(response_topic, qos_from(self.config.qos), false, body)
            .await
            .map(|()| {
                self.stats.publishes.fetch_add(1, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.stats.publish_failures.fetch_add(1, Ordering::SeqCst);
                BrokerError::PublishFailed(e.to_string())
            })
    }

    /// Background reaper: sweep the pending table at a fixed tick until
    /// told to stop (§9 "background reaper task").
    pub async fn run_pending_reaper(&self, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        while !self.shutting_down.load(Ordering::SeqCst) {
            interval.tick().await;
            self.pending.sweep_expired();
        }
    }

    /// Heartbeat task: publishes `{type:"heartbeat", client, status:
    /// "alive", ssl, timestamp}` at `interval_seconds`, only once the
    /// connection has stayed up for [`HEARTBEAT_READY_PROBES`] consecutive
    /// ~500ms probes (§4.3).
    pub async fn run_heartbeat(&self) {
        if !self.config.heartbeat.enabled {
            return;
        }
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            if !self.is_connected() {
                self.heartbeat_ready_probes.store(0, Ordering::SeqCst);
                tokio::time::sleep(HEARTBEAT_PROBE_INTERVAL).await;
                continue;
            }
            let probes = self.heartbeat_ready_probes.fetch_add(1, Ordering::SeqCst) + 1;
            if probes < u64::from(HEARTBEAT_READY_PROBES) {
                tokio::time::sleep(HEARTBEAT_PROBE_INTERVAL).await;
                continue;
            }
            self.heartbeat_active.store(true, Ordering::SeqCst);
            let payload = self.config.heartbeat.payload.clone().unwrap_or_else(|| {
                serde_json::json!({
                    "type": "heartbeat",
                    "client": self.config.client_id,
                    "status": "alive",
                    "ssl": self.config.use_tls,
                    "timestamp": chrono::Utc::now().timestamp(),
                })
            });
            if self.is_connected() && self.heartbeat_active.load(Ordering::SeqCst) {
                let _ = self
                    .client
                    .publish(
                        self.config.heartbeat.topic.clone(),
                        qos_from(self.config.qos),
                        false,
                        serde_json::to_vec(&payload).unwrap_or_default(),
                    )
                    .await;
            }
            tokio::time::sleep(Duration::from_secs(self.config.heartbeat.interval_seconds)).await;
        }
    }

    #[must_use]
    pub fn heartbeat_is_active(&self) -> bool {
        self.heartbeat_active.load(Ordering::SeqCst)
    }

    pub fn relay(&self) -> Option<&Arc<RelayClient>> {
        self.relay.as_ref()
    }

    /// Spawns the relay's per-broker drain loops on `handle`. Called once
    /// after the primary brokers have been connected. Takes an explicit
    /// [`tokio::runtime::Handle`] rather than bare `tokio::spawn` since the
    /// gateway composition root calls this from outside the runtime (see
    /// `gateway.rs` module docs).
    pub fn spawn_relay_drains(self: &Arc<Self>, handle: &tokio::runtime::Handle, relay_eventloops: Vec<rumqttc::EventLoop>) {
        if let Some(relay) = self.relay.clone() {
            for (idx, el) in relay_eventloops.into_iter().enumerate() {
                let relay = Arc::clone(&relay);
                handle.spawn(drain_session(el, idx, relay));
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.pending.fail_all();
    }

    #[must_use]
    pub fn statistics(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            connects: self.stats.connects.load(Ordering::SeqCst),
            reconnects: self.stats.reconnects.load(Ordering::SeqCst),
            publishes: self.stats.publishes.load(Ordering::SeqCst),
            publish_failures: self.stats.publish_failures.load(Ordering::SeqCst),
            messages_received: self.stats.messages_received.load(Ordering::SeqCst),
        }
    }
}

/// Plain-data snapshot of [`Statistics`] suitable for embedding in a
/// dashboard `ultima_server` category payload.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatisticsSnapshot {
    pub connects: u64,
    pub reconnects: u64,
    pub publishes: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
}

fn qos_from(q: u8) -> QoS {
    if q == 0 {
        QoS::AtMostOnce
    } else {
        QoS::AtLeastOnce
    }
}

/// `xxxxxxxx-xxxx-4xxx-Vxxx-xxxxxxxxxxxx`, `V ∈ {8..b}` (§4.3).
#[must_use]
pub fn generate_transaction_id() -> String {
    Uuid::new_v4().to_string()
}

/// Structural validation only; collisions are assumed negligible (§4.3).
#[must_use]
pub fn validate_transaction_id(s: &str) -> bool {
    Uuid::parse_str(s).is_ok() && s.len() == 36
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_transaction_ids_validate() {
        for _ in 0..1000 {
            let tid = generate_transaction_id();
            assert!(validate_transaction_id(&tid));
            assert_eq!(tid.len(), 36);
        }
    }

    #[test]
    fn malformed_transaction_id_fails_validation() {
        assert!(!validate_transaction_id("not-a-uuid"));
        assert!(!validate_transaction_id(""));
    }

    #[test]
    fn poll_error_drops_connected_state_and_stops_the_heartbeat() {
        let (client, _eventloop) = BrokerClient::new(BrokerConfig::new("127.0.0.1", 1883, "t")).unwrap();
        client.force_state(ConnectionState::Connected);
        client.heartbeat_active.store(true, Ordering::SeqCst);

        client.handle_poll_error();

        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Reconnecting);
        assert!(!client.heartbeat_active.load(Ordering::SeqCst));
    }

    #[test]
    fn poll_error_without_auto_reconnect_transitions_to_error() {
        let mut config = BrokerConfig::new("127.0.0.1", 1883, "t");
        config.auto_reconnect = false;
        let (client, _eventloop) = BrokerClient::new(config).unwrap();
        client.force_state(ConnectionState::Connected);

        client.handle_poll_error();

        assert_eq!(client.state(), ConnectionState::Error);
    }
}
