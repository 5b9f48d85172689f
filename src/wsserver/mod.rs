//! WebSocket Fan-out Server (component B) — accepts many simultaneous
//! client sockets, parses framed JSON, dispatches to the built-in dashboard
//! handler or defers to the Request Processor, and supports per-client and
//! broadcast sends (spec §4.2).
//!
//! Grounded on the teacher's `tokio_tungstenite` + `futures_util`
//! split-sink/stream idiom (connect-side `WsWriter`/`WsReader`), adapted
//! from connect to accept, and on its accept-loop/connection-map/event
//! shape for lifecycle logging.

mod connection;
mod error;
mod protocol;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub use connection::ConnectionId;
pub use error::{Result, ServerError};

use connection::ConnectionRegistry;
use crate::config::WebSocketConfig;
use crate::pool::{WorkerControl, WorkerPool};

/// Read-only snapshot lookup behind `get_dashboard_data` (§1's store
/// external collaborator, consumed here only through this narrow trait).
pub trait DashboardSource: Send + Sync {
    fn get(&self, category: &str) -> Option<Value>;
}

/// Connection/message audit trail (`connections_log`/`messages`, §4.2),
/// consumed here only through this narrow trait so `wsserver` never needs
/// the rest of [`crate::store::Store`]'s surface, mirroring
/// [`DashboardSource`]'s own decoupling.
pub trait ConnectionLog: Send + Sync {
    fn log_connect(&self, connection_id: &str, client_ip: &str);
    fn log_disconnect(&self, connection_id: &str);
    fn log_inbound(&self, connection_id: &str, text: &str);
}

/// The WebSocket Fan-out Server.
pub struct WsServer {
    config: WebSocketConfig,
    registry: Arc<ConnectionRegistry>,
    dashboard: Arc<dyn DashboardSource>,
    log: Option<Arc<dyn ConnectionLog>>,
    rpc_tx: Option<mpsc::UnboundedSender<Value>>,
    shutdown: Arc<AtomicBool>,
    pool: Arc<WorkerPool>,
    accept_id: std::sync::Mutex<Option<crate::pool::WorkerId>>,
}

impl WsServer {
    #[must_use]
    pub fn new(
        config: WebSocketConfig,
        pool: Arc<WorkerPool>,
        dashboard: Arc<dyn DashboardSource>,
        rpc_tx: Option<mpsc::UnboundedSender<Value>>,
    ) -> Self {
        Self::with_log(config, pool, dashboard, None, rpc_tx)
    }

    /// As [`Self::new`], additionally wiring connection/message audit
    /// logging (§4.2) into `log`.
    #[must_use]
    pub fn with_log(
        config: WebSocketConfig,
        pool: Arc<WorkerPool>,
        dashboard: Arc<dyn DashboardSource>,
        log: Option<Arc<dyn ConnectionLog>>,
        rpc_tx: Option<mpsc::UnboundedSender<Value>>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::default()),
            dashboard,
            log,
            rpc_tx,
            shutdown: Arc::new(AtomicBool::new(false)),
            pool,
            accept_id: std::sync::Mutex::new(None),
        }
    }

    /// `start(cfg)`: binds, listens with reuse-address and a backlog of
    /// [`crate::constants::ACCEPT_BACKLOG`] (§4.2 Lifecycle), and spawns
    /// exactly one accept-loop task via the Worker Pool.
    ///
    /// `TcpListener::bind` alone sets neither `SO_REUSEADDR` nor a
    /// non-default backlog, so the socket is built by hand through
    /// `socket2` and handed to Tokio via `TcpListener::from_std`.
    pub fn start(&self, rt: tokio::runtime::Handle) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let sock_addr: std::net::SocketAddr = addr.parse().map_err(|e| {
            ServerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;

        let socket = Socket::new(Domain::for_address(sock_addr), Type::STREAM, None)
            .map_err(ServerError::Bind)?;
        socket.set_reuse_address(true).map_err(ServerError::Bind)?;
        socket.set_nonblocking(true).map_err(ServerError::Bind)?;
        socket.bind(&sock_addr.into()).map_err(ServerError::Bind)?;
        socket
            .listen(crate::constants::ACCEPT_BACKLOG as i32)
            .map_err(ServerError::Bind)?;

        // `TcpListener::from_std` must run with a Tokio reactor entered.
        let _guard = rt.enter();
        let listener = TcpListener::from_std(socket.into()).map_err(ServerError::Bind)?;
        drop(_guard);
        if self.config.enable_logging {
            log::info!("wsserver: listening on {addr}");
        }

        let registry = Arc::clone(&self.registry);
        let dashboard = Arc::clone(&self.dashboard);
        let log = self.log.clone();
        let rpc_tx = self.rpc_tx.clone();
        let max_connections = self.config.max_connections;
        let enable_logging = self.config.enable_logging;
        let timeout_ms = self.config.timeout_ms;
        let shutdown = Arc::clone(&self.shutdown);
        let rt_for_loop = rt.clone();

        let id = self
            .pool
            .create(move |control: WorkerControl| {
                rt_for_loop.block_on(accept_loop(
                    listener,
                    registry,
                    dashboard,
                    log,
                    rpc_tx,
                    max_connections,
                    timeout_ms,
                    enable_logging,
                    shutdown,
                    control,
                ));
            })
            .map_err(|_| ServerError::ShuttingDown)?;
        *self.accept_id.lock().unwrap() = Some(id);
        Ok(())
    }

    /// `stop()`: cancels the accept loop, closes remaining sockets, joins.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(id) = self.accept_id.lock().unwrap().take() {
            let _ = self.pool.stop(id);
            let _ = self
                .pool
                .join(id, Some(std::time::Duration::from_secs(5)));
        }
        for id in self.registry.all_ids() {
            let _ = self.registry.send(
                &id,
                serde_json::to_string(&protocol::ErrorMessage::new("server shutting down"))
                    .unwrap_or_default(),
            );
            self.registry.remove(&id);
        }
    }

    pub fn send(&self, id: &ConnectionId, value: &Value) -> Result<()> {
        let text = serde_json::to_string(value).map_err(|e| ServerError::Send(e.to_string()))?;
        self.registry.send(id, text)
    }

    pub fn broadcast(&self, value: &Value) {
        if let Ok(text) = serde_json::to_string(value) {
            self.registry.broadcast(text);
        }
    }

    /// Convenience wrapper for the metrics feeder's `dashboard_update`
    /// broadcasts (§1, §4.2).
    pub fn broadcast_dashboard_update(&self, category: &str, data: Value) {
        self.broadcast(
            &serde_json::to_value(protocol::DashboardUpdate::new(category, data)).unwrap(),
        );
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    dashboard: Arc<dyn DashboardSource>,
    log: Option<Arc<dyn ConnectionLog>>,
    rpc_tx: Option<mpsc::UnboundedSender<Value>>,
    max_connections: usize,
    timeout_ms: u64,
    enable_logging: bool,
    shutdown: Arc<AtomicBool>,
    control: WorkerControl,
) {
    let mut tick = tokio::time::interval(std::time::Duration::from_millis(100));
    loop {
        if control.should_exit() || shutdown.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            _ = tick.tick() => continue,
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                if registry.len() >= max_connections {
                    if enable_logging {
                        log::warn!("wsserver: refusing connection, at max_connections ({max_connections})");
                    }
                    drop(stream);
                    continue;
                }
                let registry = Arc::clone(&registry);
                let dashboard = Arc::clone(&dashboard);
                let log = log.clone();
                let rpc_tx = rpc_tx.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer.to_string(), registry, dashboard, log, rpc_tx, timeout_ms, enable_logging).await;
                });
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    peer_addr: String,
    registry: Arc<ConnectionRegistry>,
    dashboard: Arc<dyn DashboardSource>,
    log: Option<Arc<dyn ConnectionLog>>,
    rpc_tx: Option<mpsc::UnboundedSender<Value>>,
    timeout_ms: u64,
    enable_logging: bool,
) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(s) => s,
        Err(e) => {
            log::debug!("wsserver: handshake failed from {peer_addr}: {e}");
            return;
        }
    };
    let (mut writer, mut reader) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let send_timeout = std::time::Duration::from_millis(timeout_ms);
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match tokio::time::timeout(send_timeout, writer.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    log::debug!("wsserver: per-send timeout ({}ms) exceeded, dropping connection", timeout_ms);
                    break;
                }
            }
        }
    });

    let id = registry.insert(peer_addr.clone(), tx.clone());
    if enable_logging {
        log::info!("wsserver: {id} connected from {peer_addr}");
    }
    if let Some(log) = &log {
        log.log_connect(&id.0, &peer_addr);
    }
    let _ = tx.send(WsMessage::Text(
        serde_json::to_string(&protocol::Welcome::new(&id.0)).unwrap_or_default(),
    ));

    while let Some(frame) = reader.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(_) => break,
        };
        match frame {
            WsMessage::Text(text) => {
                if let Some(log) = &log {
                    log.log_inbound(&id.0, &text);
                }
                handle_text(&id, &text, &registry, &dashboard, &rpc_tx);
            }
            WsMessage::Binary(_) => {
                log::debug!("wsserver: {id} sent a binary frame, ignoring");
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    registry.remove(&id);
    if enable_logging {
        log::info!("wsserver: {id} disconnected");
    }
    if let Some(log) = &log {
        log.log_disconnect(&id.0);
    }
    writer_task.abort();
}

fn handle_text(
    id: &ConnectionId,
    text: &str,
    registry: &ConnectionRegistry,
    dashboard: &Arc<dyn DashboardSource>,
    rpc_tx: &Option<mpsc::UnboundedSender<Value>>,
) {
    let parsed: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            let _ = registry.send(
                id,
                serde_json::to_string(&protocol::ErrorMessage::new("Invalid JSON format"))
                    .unwrap_or_default(),
            );
            return;
        }
    };

    if parsed.get("jsonrpc").and_then(Value::as_str) == Some("2.0") {
        if let Some(tx) = rpc_tx {
            let _ = tx.send(parsed);
        }
        return;
    }

    let reply = match parsed.get("type").and_then(Value::as_str) {
        Some("get_dashboard_data") => {
            let categories = parsed
                .get("categories")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_else(protocol::default_categories);
            let mut data = serde_json::Map::new();
            for category in categories {
                if let Some(value) = dashboard.get(&category) {
                    data.insert(category, value);
                }
            }
            serde_json::to_value(protocol::DashboardData::new(data)).unwrap()
        }
        Some("subscribe_updates") => {
            serde_json::to_value(protocol::SubscriptionConfirmed::default()).unwrap()
        }
        _ => serde_json::to_value(protocol::Echo::new(parsed)).unwrap(),
    };
    let _ = registry.send(id, serde_json::to_string(&reply).unwrap_or_default());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;

    struct StaticDashboard(std::collections::HashMap<&'static str, Value>);
    impl DashboardSource for StaticDashboard {
        fn get(&self, category: &str) -> Option<Value> {
            self.0.get(category).cloned()
        }
    }

    fn config(port: u16) -> WebSocketConfig {
        WebSocketConfig {
            host: "127.0.0.1".to_string(),
            port,
            max_connections: 10,
            timeout_ms: 1000,
            enable_logging: false,
        }
    }

    #[tokio::test]
    async fn echoes_unrecognized_message_type() {
        let pool = Arc::new(WorkerPool::new());
        let dashboard = Arc::new(StaticDashboard(Default::default()));
        let server = WsServer::new(config(19801), Arc::clone(&pool), dashboard, None);
        server.start(tokio::runtime::Handle::current()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (mut ws, _) = tokio_tungstenite::connect_async("ws://127.0.0.1:19801")
            .await
            .unwrap();
        let _welcome = ws.next().await.unwrap().unwrap();

        ws.send(ClientMessage::Text(r#"{"type":"hello","n":1}"#.to_string()))
            .await
            .unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&reply.into_text().unwrap()).unwrap();
        assert_eq!(value["type"], "echo");
        assert_eq!(value["original"]["n"], 1);
        assert_eq!(value["server"], "backend-datalink");

        server.stop();
    }

    #[tokio::test]
    async fn returns_dashboard_snapshot_for_requested_category() {
        let pool = Arc::new(WorkerPool::new());
        let mut data = std::collections::HashMap::new();
        data.insert(
            "ram",
            serde_json::json!({"usage_percent":42.0,"used_gb":3.4,"total_gb":8.0}),
        );
        let dashboard = Arc::new(StaticDashboard(data));
        let server = WsServer::new(config(19802), Arc::clone(&pool), dashboard, None);
        server.start(tokio::runtime::Handle::current()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (mut ws, _) = tokio_tungstenite::connect_async("ws://127.0.0.1:19802")
            .await
            .unwrap();
        let _welcome = ws.next().await.unwrap().unwrap();
        ws.send(ClientMessage::Text(
            r#"{"type":"get_dashboard_data","categories":["ram"]}"#.to_string(),
        ))
        .await
        .unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&reply.into_text().unwrap()).unwrap();
        assert_eq!(value["type"], "dashboard_data");
        assert_eq!(value["data"]["ram"]["usage_percent"], 42.0);

        server.stop();
    }

    #[tokio::test]
    async fn invalid_json_gets_error_reply_without_closing() {
        let pool = Arc::new(WorkerPool::new());
        let dashboard = Arc::new(StaticDashboard(Default::default()));
        let server = WsServer::new(config(19803), Arc::clone(&pool), dashboard, None);
        server.start(tokio::runtime::Handle::current()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (mut ws, _) = tokio_tungstenite::connect_async("ws://127.0.0.1:19803")
            .await
            .unwrap();
        let _welcome = ws.next().await.unwrap().unwrap();
        ws.send(ClientMessage::Text("not json".to_string()))
            .await
            .unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&reply.into_text().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "Invalid JSON format");

        ws.send(ClientMessage::Text(r#"{"type":"ping"}"#.to_string()))
            .await
            .unwrap();
        let reply2 = ws.next().await.unwrap().unwrap();
        assert!(reply2.into_text().unwrap().contains("echo"));

        server.stop();
    }

    #[tokio::test]
    async fn max_connections_refuses_the_nplus1th_socket() {
        let pool = Arc::new(WorkerPool::new());
        let dashboard = Arc::new(StaticDashboard(Default::default()));
        let mut cfg = config(19804);
        cfg.max_connections = 1;
        let server = WsServer::new(cfg, Arc::clone(&pool), dashboard, None);
        server.start(tokio::runtime::Handle::current()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (mut first, _) = tokio_tungstenite::connect_async("ws://127.0.0.1:19804")
            .await
            .unwrap();
        let _welcome = first.next().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connection_count(), 1);

        let second = tokio_tungstenite::connect_async("ws://127.0.0.1:19804").await;
        // Either the handshake itself is refused or the accept loop drops it
        // immediately after: either way no welcome arrives and the
        // registered count stays at 1.
        if let Ok((mut ws2, _)) = second {
            let got_welcome = tokio::time::timeout(Duration::from_millis(200), ws2.next()).await;
            assert!(got_welcome.is_err() || got_welcome.unwrap().is_none());
        }
        assert_eq!(server.connection_count(), 1);

        server.stop();
    }

    #[derive(Default)]
    struct RecordingLog(std::sync::Mutex<Vec<String>>);
    impl ConnectionLog for RecordingLog {
        fn log_connect(&self, connection_id: &str, client_ip: &str) {
            self.0
                .lock()
                .unwrap()
                .push(format!("connect:{connection_id}:{client_ip}"));
        }
        fn log_disconnect(&self, connection_id: &str) {
            self.0.lock().unwrap().push(format!("disconnect:{connection_id}"));
        }
        fn log_inbound(&self, connection_id: &str, text: &str) {
            self.0.lock().unwrap().push(format!("inbound:{connection_id}:{text}"));
        }
    }

    #[tokio::test]
    async fn connection_lifecycle_and_inbound_frames_reach_the_log() {
        let pool = Arc::new(WorkerPool::new());
        let dashboard = Arc::new(StaticDashboard(Default::default()));
        let log = Arc::new(RecordingLog::default());
        let server = WsServer::with_log(
            config(19805),
            Arc::clone(&pool),
            dashboard,
            Some(Arc::clone(&log) as Arc<dyn ConnectionLog>),
            None,
        );
        server.start(tokio::runtime::Handle::current()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (mut ws, _) = tokio_tungstenite::connect_async("ws://127.0.0.1:19805")
            .await
            .unwrap();
        let _welcome = ws.next().await.unwrap().unwrap();
        ws.send(ClientMessage::Text(r#"{"type":"ping"}"#.to_string()))
            .await
            .unwrap();
        let _reply = ws.next().await.unwrap().unwrap();
        drop(ws);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let events = log.0.lock().unwrap().clone();
        assert!(events.iter().any(|e| e.starts_with("connect:")));
        assert!(events.iter().any(|e| e.contains("inbound:") && e.contains("ping")));
        assert!(events.iter().any(|e| e.starts_with("disconnect:")));

        server.stop();
    }
}
