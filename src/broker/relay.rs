//! Conditional multi-broker topic relay (spec §4.3.2), grounded on
//! `conditional_relay_client.c`'s connect-primary/defer-secondary/forward-
//! by-substring shape, generalized from the source's single secondary flag
//! to a per-broker latch (§9 "Conditional relay secondary-ready flag").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};

use super::config::{RelayBrokerEntry, RelayConfig, RelayRule};
use super::error::{BrokerError, Result};
use crate::constants::{MAX_RELAY_BROKERS, MAX_RELAY_RULES};

struct BrokerSession {
    entry: RelayBrokerEntry,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

/// Owns up to [`MAX_RELAY_BROKERS`] broker sessions and up to
/// [`MAX_RELAY_RULES`] forwarding rules.
pub struct RelayClient {
    rules: Vec<RelayRule>,
    prefix: Option<String>,
    conditional: bool,
    sessions: Vec<BrokerSession>,
    secondary_ready: Vec<Arc<AtomicBool>>,
    error_count: AtomicU64,
    forwarded_recently: Mutex<HashMap<(usize, String), Instant>>,
}

impl RelayClient {
    /// Builds sessions and rule table from configuration. Fails with
    /// [`BrokerError::RelayTableFull`] if either bound is exceeded (§7
    /// Capacity, reported at configuration time). Returns one
    /// [`rumqttc::EventLoop`] per broker session alongside `Self`; the
    /// caller is expected to drive each with [`drain_session`] (mirrors
    /// [`super::BrokerClient::new`]'s own client/eventloop handoff).
    pub fn new(config: &RelayConfig) -> Result<(Self, Vec<rumqttc::EventLoop>)> {
        if config.brokers.len() > MAX_RELAY_BROKERS {
            return Err(BrokerError::RelayTableFull);
        }
        if config.rules.len() > MAX_RELAY_RULES {
            return Err(BrokerError::RelayTableFull);
        }

        let mut sessions = Vec::with_capacity(config.brokers.len());
        let mut secondary_ready = Vec::with_capacity(config.brokers.len());
        let mut eventloops = Vec::with_capacity(config.brokers.len());
        for entry in &config.brokers {
            let mut opts = MqttOptions::new(entry.client_id.clone(), entry.host.clone(), entry.port);
            opts.set_keep_alive(Duration::from_secs(crate::constants::DEFAULT_KEEPALIVE_SECS));
            if let (Some(u), Some(p)) = (&entry.username, &entry.password) {
                opts.set_credentials(u.clone(), p.clone());
            }
            let (client, eventloop) = AsyncClient::new(opts, 64);
            sessions.push(BrokerSession {
                entry: entry.clone(),
                client,
                connected: Arc::new(AtomicBool::new(false)),
            });
            secondary_ready.push(Arc::new(AtomicBool::new(false)));
            eventloops.push(eventloop);
        }

        Ok((
            Self {
                rules: config.rules.clone(),
                prefix: config.prefix.clone(),
                conditional: config.conditional_relay,
                sessions,
                secondary_ready,
                error_count: AtomicU64::new(0),
                forwarded_recently: Mutex::new(HashMap::new()),
            },
            eventloops,
        ))
    }

    /// Connects every broker marked primary. Non-primary brokers stay
    /// disconnected under `conditional_relay` until
    /// [`Self::mark_secondary_ready`] + [`Self::connect_secondary_brokers`]
    /// (§4.3.2 "On start, connect all brokers marked primary").
    pub async fn connect_primary_brokers(&self) {
        for idx in 0..self.sessions.len() {
            if self.sessions[idx].entry.primary || !self.conditional {
                self.mark_connected(idx).await;
            }
        }
    }

    /// Re-models the source's single process-wide "secondary ready" flag
    /// as a per-broker latch (§9).
    pub fn mark_secondary_ready(&self, broker_index: usize) {
        if let Some(flag) = self.secondary_ready.get(broker_index) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Connects every non-primary broker whose secondary-ready latch has
    /// been raised and that isn't connected yet.
    pub async fn connect_secondary_brokers(&self) {
        for idx in 0..self.sessions.len() {
            if !self.sessions[idx].entry.primary
                && self.secondary_ready[idx].load(Ordering::SeqCst)
                && !self.sessions[idx].connected.load(Ordering::SeqCst)
            {
                self.mark_connected(idx).await;
            }
        }
    }

    /// Marks broker `idx` connected and subscribes every rule whose
    /// source broker is `idx` to its source topic (§4.3.2 "For each rule,
    /// subscribe to the source topic on the source broker").
    async fn mark_connected(&self, idx: usize) {
        self.sessions[idx].connected.store(true, Ordering::SeqCst);
        for rule in &self.rules {
            if rule.source_broker == idx
                && self.sessions[idx]
                    .client
                    .subscribe(&rule.source_topic, QoS::AtMostOnce)
                    .await
                    .is_err()
            {
                self.error_count.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[must_use]
    pub fn is_connected(&self, broker_index: usize) -> bool {
        self.sessions
            .get(broker_index)
            .is_some_and(|s| s.connected.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Called for every message received on a source broker's subscribed
    /// topic. Matches rules by substring, computes the effective
    /// destination topic, and forwards the raw payload.
    pub async fn on_source_message(&self, source_broker: usize, topic: &str, payload: &[u8]) {
        for rule in &self.rules {
            if rule.source_broker != source_broker || !topic.contains(&rule.source_topic) {
                continue;
            }
            let dest_prefix = rule
                .prefix
                .clone()
                .or_else(|| self.prefix.clone())
                .unwrap_or_default();
            let dest_topic = format!("{dest_prefix}{}", rule.destination_topic);

            if !self.is_connected(rule.destination_broker) {
                self.error_count.fetch_add(1, Ordering::SeqCst);
                continue;
            }

            if self.was_just_forwarded(rule.destination_broker, &dest_topic, payload) {
                // Echo of our own prior forward arriving back via a
                // bidirectional rule; drop it rather than bounce forever
                // (§9 open question, resolved per DESIGN.md).
                continue;
            }

            let dest = &self.sessions[rule.destination_broker].client;
            if dest
                .publish(dest_topic.clone(), QoS::AtMostOnce, false, payload.to_vec())
                .await
                .is_err()
            {
                self.error_count.fetch_add(1, Ordering::SeqCst);
            } else {
                self.record_forwarded(rule.destination_broker, dest_topic, payload);
            }
        }
    }

    fn was_just_forwarded(&self, broker: usize, topic: &str, payload: &[u8]) -> bool {
        let key = (broker, format!("{topic}:{}", payload.len()));
        let guard = self.forwarded_recently.lock().unwrap();
        guard
            .get(&key)
            .is_some_and(|t| t.elapsed() < Duration::from_secs(2))
    }

    fn record_forwarded(&self, broker: usize, topic: String, payload: &[u8]) {
        let key = (broker, format!("{topic}:{}", payload.len()));
        let mut guard = self.forwarded_recently.lock().unwrap();
        guard.retain(|_, t| t.elapsed() < Duration::from_secs(2));
        guard.insert(key, Instant::now());
    }
}

/// Drains a relay broker session's event loop, forwarding every inbound
/// PUBLISH into [`RelayClient::on_source_message`]. Spawned once per
/// session by the owning [`super::BrokerClient`].
pub async fn drain_session(mut eventloop: rumqttc::EventLoop, broker_index: usize, relay: Arc<RelayClient>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                relay
                    .on_source_message(broker_index, &p.topic, &p.payload)
                    .await;
            }
            Ok(_) => {}
            Err(_) => {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_broker_config() -> RelayConfig {
        RelayConfig {
            enabled: true,
            conditional_relay: true,
            prefix: None,
            brokers: vec![
                RelayBrokerEntry {
                    host: "127.0.0.1".into(),
                    port: 1883,
                    client_id: "relay-0".into(),
                    primary: true,
                    ..Default::default()
                },
                RelayBrokerEntry {
                    host: "127.0.0.1".into(),
                    port: 1884,
                    client_id: "relay-1".into(),
                    primary: false,
                    ..Default::default()
                },
            ],
            rules: vec![RelayRule {
                source_topic: "src/topic".into(),
                destination_topic: "dst/topic".into(),
                prefix: None,
                source_broker: 0,
                destination_broker: 1,
                bidirectional: false,
            }],
        }
    }

    #[tokio::test]
    async fn secondary_broker_stays_disconnected_until_ready() {
        let (relay, _eventloops) = RelayClient::new(&two_broker_config()).unwrap();
        relay.connect_primary_brokers().await;
        assert!(relay.is_connected(0));
        assert!(!relay.is_connected(1));

        relay.connect_secondary_brokers().await;
        assert!(!relay.is_connected(1), "still gated, readiness not raised");

        relay.mark_secondary_ready(1);
        relay.connect_secondary_brokers().await;
        assert!(relay.is_connected(1));
    }

    #[tokio::test]
    async fn forward_to_disconnected_destination_increments_error_count() {
        let (relay, _eventloops) = RelayClient::new(&two_broker_config()).unwrap();
        relay.connect_primary_brokers().await;
        relay.on_source_message(0, "src/topic", b"{}").await;
        assert_eq!(relay.error_count(), 1);
    }

    #[test]
    fn rejects_configs_over_the_table_caps() {
        let mut cfg = two_broker_config();
        cfg.rules = (0..40)
            .map(|i| RelayRule {
                source_topic: format!("t{i}"),
                ..Default::default()
            })
            .collect();
        assert!(matches!(
            RelayClient::new(&cfg),
            Err(BrokerError::RelayTableFull)
        ));
    }
}
