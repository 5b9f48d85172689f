//! Composition root (SPEC_FULL.md "GATEWAY COMPOSITION ROOT") — replaces
//! the original's `g_server` / `g_database` / `g_system_collector` module
//! globals (§9 redesign note) with one owned `Gateway` struct, built once
//! in `main` and threaded through every closure that needs it.
//!
//! `build`/`start` take an explicit [`tokio::runtime::Handle`] rather than
//! calling `Handle::current()`, so they can run as plain synchronous
//! calls from `main`'s own thread before the runtime's async machinery is
//! ever entered there — each internal `handle.block_on(..)` is then a
//! fresh top-level entry, not a nested one.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::broker::BrokerClient;
use crate::config::GatewayConfig;
use crate::metrics::MetricsFeeder;
use crate::pool::WorkerPool;
use crate::processor::{Authority, MethodOutcome, RequestProcessor};
use crate::store::Store;
use crate::wsserver::{ConnectionLog, DashboardSource, WsServer};

/// Bridges the store into the WebSocket server's `get_dashboard_data`
/// handler without exposing the rest of [`Store`]'s surface there.
struct StoreDashboard(Arc<Store>);

impl DashboardSource for StoreDashboard {
    fn get(&self, category: &str) -> Option<Value> {
        self.0.get(category).ok()
    }
}

/// Bridges the store into the WebSocket server's connection/message audit
/// trail (§4.2 `connections_log`/`messages`) without exposing the rest of
/// [`Store`]'s surface there.
struct StoreConnectionLog(Arc<Store>);

impl ConnectionLog for StoreConnectionLog {
    fn log_connect(&self, connection_id: &str, client_ip: &str) {
        if let Err(e) = self.0.log_connection(connection_id, client_ip) {
            log::warn!("gateway: failed to log connection {connection_id}: {e}");
        }
    }

    fn log_disconnect(&self, connection_id: &str) {
        if let Err(e) = self.0.log_disconnection(connection_id) {
            log::warn!("gateway: failed to log disconnection {connection_id}: {e}");
        }
    }

    fn log_inbound(&self, connection_id: &str, text: &str) {
        if let Err(e) = self.0.log_message(connection_id, crate::store::Direction::In, text) {
            log::warn!("gateway: failed to log inbound message from {connection_id}: {e}");
        }
    }
}

/// Owns every long-lived subsystem and the single global shutdown flag.
pub struct Gateway {
    pub pool: Arc<WorkerPool>,
    pub ws: Arc<WsServer>,
    pub broker: Arc<BrokerClient>,
    pub processor: Arc<RequestProcessor>,
    pub store: Arc<Store>,
    pub metrics: Arc<MetricsFeeder>,
    pub config: GatewayConfig,
    rt: tokio::runtime::Handle,
    broker_eventloop: std::sync::Mutex<Option<rumqttc::EventLoop>>,
    rpc_rx: std::sync::Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<Value>>>,
    shutdown: Arc<AtomicBool>,
}

impl Gateway {
    /// Builds every subsystem from a validated [`GatewayConfig`]. Opens
    /// the store at `config.database.path` (or in-memory when
    /// `config.database.enabled` is false), builds the broker client (not
    /// yet connected), and wires the WebSocket server's dashboard source
    /// to the store.
    pub fn build(config: GatewayConfig, rt: tokio::runtime::Handle) -> anyhow::Result<Self> {
        let pool = Arc::new(WorkerPool::new());

        let store = Arc::new(if config.database.enabled {
            Store::open(
                Path::new(&config.database.path),
                config.database.log_connections,
                config.database.log_messages,
            )?
        } else {
            Store::open_in_memory(false, false)?
        });

        let (broker, eventloop) = BrokerClient::new(config.broker.clone())?;
        let broker = Arc::new(broker);

        let (rpc_tx, rpc_rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
        let ws = Arc::new(WsServer::with_log(
            config.websocket.clone(),
            Arc::clone(&pool),
            Arc::new(StoreDashboard(Arc::clone(&store))),
            Some(Arc::new(StoreConnectionLog(Arc::clone(&store)))),
            Some(rpc_tx),
        ));

        let response_topic = format!(
            "{}/{}/{}",
            config.broker.base_prefix, config.broker.service, config.broker.response_suffix
        );
        let processor = Arc::new(RequestProcessor::new(
            Arc::clone(&pool),
            Arc::clone(&broker),
            rt.clone(),
            response_topic,
        ));

        let metrics = Arc::new(MetricsFeeder::new(Arc::clone(&store), Arc::clone(&ws), Arc::clone(&broker)));

        // §1/§4.4: the Request Processor decodes inbound requests "from the
        // bus" independently of the WebSocket bridge. Any inbound PUBLISH
        // whose topic carries the configured request suffix is routed here;
        // `dispatch_response` (already invoked for every PUBLISH) keeps
        // handling transaction-ID-matched replies to our own `call_async`
        // calls, so the two paths don't double-process the same message.
        let processor_for_bus = Arc::clone(&processor);
        let request_suffix = format!("/{}", config.broker.request_suffix);
        broker.set_message_handler(move |topic, payload| {
            if topic.contains(&request_suffix) {
                if let Err(e) = processor_for_bus.process_bytes(payload) {
                    log::debug!("gateway: dropped bus-sourced rpc request: {e}");
                }
            }
        });

        Ok(Self {
            pool,
            ws,
            broker,
            processor,
            store,
            metrics,
            config,
            rt,
            broker_eventloop: std::sync::Mutex::new(Some(eventloop)),
            rpc_rx: std::sync::Mutex::new(Some(rpc_rx)),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Registers the two illustrative demonstration methods named in
    /// SPEC_FULL.md ("two illustrative methods (`ping`, `pool_status`) are
    /// registered by `main.rs`"). Exposed here so both `main` and tests
    /// exercise the identical registration.
    pub fn register_demo_methods(&self) {
        let pool = Arc::clone(&self.pool);
        self.processor
            .register_method("ping", |_params: Value, _authority: Authority| -> MethodOutcome {
                Ok("pong".to_string())
            });
        self.processor.register_method(
            "pool_status",
            move |_params: Value, _authority: Authority| -> MethodOutcome {
                Ok(serde_json::json!({
                    "worker_count": pool.count(),
                    "worker_ids": pool.all_ids().iter().map(ToString::to_string).collect::<Vec<_>>(),
                })
                .to_string())
            },
        );
    }

    /// Starts the accept loop, broker session, and metrics feeder. Called
    /// synchronously from `main`'s own thread, before that thread ever
    /// blocks on the runtime itself (see module docs).
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.ws.start(self.rt.clone())?;

        let rpc_rx = self
            .rpc_rx
            .lock()
            .unwrap()
            .take()
            .expect("start() called more than once");
        let processor = Arc::clone(&self.processor);
        self.rt.spawn(drain_ws_rpc(processor, rpc_rx));

        let eventloop = self
            .broker_eventloop
            .lock()
            .unwrap()
            .take()
            .expect("start() called more than once");
        self.rt.block_on(self.broker.start())?;

        if let Some(relay_eventloops) = self.broker.take_relay_eventloops() {
            self.broker.spawn_relay_drains(&self.rt, relay_eventloops);
        }

        let broker = Arc::clone(&self.broker);
        self.rt.spawn(drain_broker(broker, eventloop));

        let broker = Arc::clone(&self.broker);
        self.rt
            .spawn(async move { broker.run_pending_reaper(Duration::from_secs(1)).await });

        let broker = Arc::clone(&self.broker);
        self.rt.spawn(async move { broker.run_heartbeat().await });

        if self.config.system_data.enabled {
            let metrics = Arc::clone(&self.metrics);
            let interval = Duration::from_secs(self.config.system_data.poll_interval_seconds);
            let shutdown = Arc::clone(&self.shutdown);
            self.rt.spawn(async move { metrics.run(interval, shutdown).await });
        }

        Ok(())
    }

    /// Orchestrated shutdown: stop the WebSocket server, the processor's
    /// in-flight workers, then the broker, and set the metrics feeder's
    /// stop flag. Order matters: stop accepting new work before joining
    /// what's already running (§4.4 Shutdown, generalized to every
    /// subsystem).
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.ws.stop();
        self.processor.shutdown();
        self.broker.shutdown();
        self.pool.shutdown();
    }
}

/// Drives the WebSocket server's local in-process bridge (§1: "B ...
/// defers to D via a local in-process channel"): every `jsonrpc: "2.0"`
/// frame a client sends is forwarded here from `handle_text` and processed
/// exactly as if it had arrived over the broker bus.
async fn drain_ws_rpc(processor: Arc<RequestProcessor>, mut rx: tokio::sync::mpsc::UnboundedReceiver<Value>) {
    while let Some(value) = rx.recv().await {
        if let Err(e) = processor.process_value(value) {
            log::debug!("gateway: dropped ws-bridged rpc request: {e}");
        }
    }
}

async fn drain_broker(broker: Arc<BrokerClient>, mut eventloop: rumqttc::EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(event) => broker.handle_event(event).await,
            Err(e) => {
                log::warn!("gateway: broker event loop error: {e}");
                broker.handle_poll_error();
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConfig, ConnectionState};

    /// A PUBLISH arriving on a topic carrying the configured request
    /// suffix must reach the Request Processor through the broker's
    /// message handler, independently of the WebSocket bridge (§1: "D
    /// answers independently via C").
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bus_sourced_request_reaches_the_processor() {
        let pool = Arc::new(WorkerPool::new());
        let broker_config = BrokerConfig::new("127.0.0.1", 1883, "t");
        let (broker, _eventloop) = BrokerClient::new(broker_config.clone()).unwrap();
        broker.force_state(ConnectionState::Connected);
        let broker = Arc::new(broker);
        let processor = Arc::new(RequestProcessor::new(
            Arc::clone(&pool),
            Arc::clone(&broker),
            tokio::runtime::Handle::current(),
            "backend-datalink/gateway/response",
        ));
        processor.register_method("ping", |_params, _authority| Ok("pong".to_string()));

        let processor_for_bus = Arc::clone(&processor);
        let request_suffix = format!("/{}", broker_config.request_suffix);
        broker.set_message_handler(move |topic, payload| {
            if topic.contains(&request_suffix) {
                let _ = processor_for_bus.process_bytes(payload);
            }
        });

        let payload = serde_json::to_vec(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": "bus-1",
            "method": "ping",
            "params": {},
        }))
        .unwrap();
        let publish = rumqttc::Publish::new(
            "backend-datalink/gateway/ping/request/bus-1",
            rumqttc::QoS::AtMostOnce,
            payload,
        );
        broker
            .handle_event(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish)))
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.inflight_count(), 0);
        pool.shutdown();
    }

    /// The WebSocket server's local in-process bridge (§1) must actually
    /// reach the Request Processor: a `jsonrpc: "2.0"` value sent down the
    /// channel ends up dispatched on the pool exactly like a bus-sourced
    /// request would.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ws_bridged_request_reaches_the_processor() {
        let pool = Arc::new(WorkerPool::new());
        let (broker, _eventloop) = BrokerClient::new(BrokerConfig::new("127.0.0.1", 1883, "t")).unwrap();
        broker.force_state(ConnectionState::Connected);
        let broker = Arc::new(broker);
        let processor = Arc::new(RequestProcessor::new(
            Arc::clone(&pool),
            broker,
            tokio::runtime::Handle::current(),
            "backend-datalink/gateway/response",
        ));
        processor.register_method("ping", |_params, _authority| Ok("pong".to_string()));

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
        tokio::spawn(drain_ws_rpc(Arc::clone(&processor), rx));

        tx.send(serde_json::json!({
            "jsonrpc": "2.0",
            "id": "bridge-1",
            "method": "ping",
            "params": {},
        }))
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.inflight_count(), 0);
        pool.shutdown();
    }
}
