//! Request Processor (component D) — decodes inbound RPC requests from the
//! bus, dispatches them onto the Worker Pool with bounded concurrency, and
//! publishes replies on the matching response topic (spec §4.4).
//!
//! Grounded in the teacher's `hub/command_channel.rs` method-name-keyed
//! dispatch shape (a lookup table with a documented default fallback) and
//! `hub/lifecycle.rs`'s shutdown-flag-then-bounded-join pattern, adapted
//! here from agent lifecycle to per-request worker lifecycle.

mod error;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;

pub use error::{ProcessorError, Result};

use crate::broker::BrokerClient;
use crate::constants::{JOIN_POLL_INTERVAL, MAX_REQUEST_BYTES, SHUTDOWN_JOIN_TIMEOUT};
use crate::pool::{JoinOutcome, WorkerId, WorkerPool};

/// Coarse-grained caller classification carried on every RPC request (§6).
/// Unknown values map to [`Authority::Guest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Admin,
    User,
    Guest,
    System,
}

impl Authority {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("admin") => Self::Admin,
            Some("user") => Self::User,
            Some("system") => Self::System,
            _ => Self::Guest,
        }
    }
}

/// What a registered method handler returns: the operation's result
/// (embedded per §4.4's response-envelope rules) or an error message.
pub type MethodOutcome = std::result::Result<String, String>;

type MethodHandler = Arc<dyn Fn(Value, Authority) -> MethodOutcome + Send + Sync>;

/// The Request Processor (component D): JSON-RPC 2.0 envelope validation,
/// per-request dispatch onto the Worker Pool, response publication via the
/// Broker RPC Client.
pub struct RequestProcessor {
    pool: Arc<WorkerPool>,
    broker: Arc<BrokerClient>,
    rt: tokio::runtime::Handle,
    response_topic: String,
    methods: Mutex<HashMap<String, MethodHandler>>,
    inflight: Arc<Mutex<HashSet<WorkerId>>>,
    shutting_down: AtomicBool,
}

impl RequestProcessor {
    /// `response_topic` is the single configured topic every reply is
    /// published on (§8 "exactly one response is published on the
    /// configured response topic" — a fixed topic, not a per-transaction
    /// one; distinct from the per-call response topics `call_async` uses).
    #[must_use]
    pub fn new(
        pool: Arc<WorkerPool>,
        broker: Arc<BrokerClient>,
        rt: tokio::runtime::Handle,
        response_topic: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            broker,
            rt,
            response_topic: response_topic.into(),
            methods: Mutex::new(HashMap::new()),
            inflight: Arc::new(Mutex::new(HashSet::new())),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Registers a method handler (§9's open-question extension point). The
    /// out-of-the-box registry is empty: every unregistered method produces
    /// `Unknown method: <m>` (§4.4 step 3).
    pub fn register_method<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value, Authority) -> MethodOutcome + Send + Sync + 'static,
    {
        self.methods
            .lock()
            .unwrap()
            .insert(name.into(), Arc::new(handler));
    }

    /// Drives the bus-sourced path: receives raw request payloads (e.g. a
    /// broker subscription bridged through this channel) and processes
    /// each in turn (§1 "decodes inbound RPC requests from the bus").
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(payload) = rx.recv().await {
            if let Err(e) = self.process_bytes(&payload) {
                log::debug!("processor: dropped request: {e}");
            }
        }
    }

    /// Byte-buffer input contract (§4.4): oversized or non-UTF-8 input is
    /// rejected without a response (the caller will time out); unparseable
    /// JSON is treated the same way, since there is then no envelope to
    /// extract even a best-effort `id` from.
    pub fn process_bytes(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_REQUEST_BYTES {
            return Err(ProcessorError::RejectedPayload(format!(
                "payload of {} bytes exceeds the {}-byte limit",
                payload.len(),
                MAX_REQUEST_BYTES
            )));
        }
        let text = std::str::from_utf8(payload)
            .map_err(|e| ProcessorError::RejectedPayload(e.to_string()))?;
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProcessorError::RejectedPayload(e.to_string()))?;
        self.process_value(value)
    }

    /// Processes an already-parsed JSON-RPC envelope. Used directly by
    /// callers that source requests from somewhere other than the raw byte
    /// bus (e.g. the WebSocket server's local in-process bridge channel).
    pub fn process_value(&self, value: Value) -> Result<()> {
        let id = normalize_id(value.get("id").cloned().unwrap_or(Value::Null));

        if value.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return self.reply_error(id, "jsonrpc must equal \"2.0\"");
        }
        let Some(method) = value
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return self.reply_error(id, "method must be a string");
        };
        let Some(params) = value.get("params").and_then(Value::as_object).cloned() else {
            return self.reply_error(id, "params must be an object");
        };
        let authority = Authority::parse(value.get("authority").and_then(Value::as_str));

        if self.shutting_down.load(Ordering::SeqCst) {
            return self.reply_error(id, "Server is shutting down");
        }

        self.dispatch(id, method, Value::Object(params), authority)
    }

    fn reply_error(&self, id: Value, message: impl Into<String>) -> Result<()> {
        self.publish(error_envelope(id, message.into()));
        Ok(())
    }

    /// Enqueues a worker via the pool that runs the method, then publishes
    /// the response (§4.4 Dispatch steps 2-4).
    fn dispatch(
        &self,
        id: Value,
        method: String,
        params: Value,
        authority: Authority,
    ) -> Result<()> {
        let handler = self.methods.lock().unwrap().get(&method).cloned();
        let broker = Arc::clone(&self.broker);
        let rt = self.rt.clone();
        let response_topic = self.response_topic.clone();
        let inflight = Arc::clone(&self.inflight);
        let cell: Arc<Mutex<Option<WorkerId>>> = Arc::new(Mutex::new(None));
        let cell_for_worker = Arc::clone(&cell);
        let method_for_unknown = method;

        let worker_id = self
            .pool
            .create(move |_control| {
                let started = Instant::now();
                let outcome = match &handler {
                    Some(h) => h(params, authority),
                    None => Err(format!("Unknown method: {method_for_unknown}")),
                };
                let envelope = response_envelope(id, outcome, started.elapsed());
                rt.block_on(async {
                    if let Err(e) = broker.publish_response(&response_topic, &envelope).await {
                        log::warn!("processor: failed to publish response: {e}");
                    }
                });

                // Wait for the dispatching thread to hand back this
                // worker's own ID before removing it from the in-flight
                // set (the ID isn't known until `pool.create` returns).
                let my_id = loop {
                    if let Some(found) = *cell_for_worker.lock().unwrap() {
                        break found;
                    }
                    std::thread::sleep(JOIN_POLL_INTERVAL);
                };
                inflight.lock().unwrap().remove(&my_id);
            })
            .map_err(|e| ProcessorError::DispatchFailed(e.to_string()))?;

        *cell.lock().unwrap() = Some(worker_id);
        self.inflight.lock().unwrap().insert(worker_id);
        Ok(())
    }

    /// Publishes off-thread via `rt.spawn` rather than `block_on`: this
    /// path is also reached from `process_value`/`process_bytes` when
    /// they're called from an async context (`drain_ws_rpc`, the broker's
    /// message handler inside `handle_event`), where
    /// `Handle::block_on` would panic.
    fn publish(&self, envelope: Value) {
        let broker = Arc::clone(&self.broker);
        let topic = self.response_topic.clone();
        self.rt.spawn(async move {
            if let Err(e) = broker.publish_response(&topic, &envelope).await {
                log::warn!("processor: failed to publish synchronous error reply: {e}");
            }
        });
    }

    /// Sets the shutdown flag (blocking new dispatches) then joins every
    /// tracked worker with a bounded per-worker timeout, logging and
    /// continuing past any that exceed it (§4.4 Shutdown).
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let ids: Vec<WorkerId> = self.inflight.lock().unwrap().iter().copied().collect();
        for id in ids {
            match self.pool.join(id, Some(SHUTDOWN_JOIN_TIMEOUT)) {
                Ok(JoinOutcome::Exited) | Err(_) => {}
                Ok(JoinOutcome::TimedOut) => {
                    log::warn!("processor: worker {id} did not exit within shutdown timeout");
                }
            }
        }
    }

    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }
}

fn normalize_id(id: Value) -> Value {
    match id {
        Value::String(_) | Value::Number(_) => id,
        _ => Value::String("unknown".to_string()),
    }
}

fn error_envelope(id: Value, message: String) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": -1, "message": message },
    })
}

/// Builds the response envelope per §4.4's embedding rules: a
/// `{`-prefixed string result is re-parsed as JSON; a non-empty
/// non-object string is embedded as-is; an empty string becomes
/// `"Operation completed successfully"`. `processing_time_ms` is the
/// optional numeric field named in §6.
fn response_envelope(id: Value, outcome: MethodOutcome, elapsed: Duration) -> Value {
    match outcome {
        Ok(result) => {
            let result_value = if result.starts_with('{') {
                serde_json::from_str(&result).unwrap_or(Value::String(result))
            } else if result.is_empty() {
                Value::String("Operation completed successfully".to_string())
            } else {
                Value::String(result)
            };
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result_value,
                "processing_time_ms": elapsed.as_millis() as u64,
            })
        }
        Err(message) => error_envelope(id, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConfig, ConnectionState};

    fn connected_broker() -> (Arc<BrokerClient>, rumqttc::EventLoop) {
        let (client, eventloop) = BrokerClient::new(BrokerConfig::new("127.0.0.1", 1883, "t")).unwrap();
        client.force_state(ConnectionState::Connected);
        (Arc::new(client), eventloop)
    }

    #[test]
    fn unknown_method_produces_the_documented_error_message() {
        let envelope = response_envelope(
            Value::String("t-7".to_string()),
            Err("Unknown method: does_not_exist".to_string()),
            Duration::from_millis(0),
        );
        assert_eq!(envelope["jsonrpc"], "2.0");
        assert_eq!(envelope["id"], "t-7");
        assert_eq!(envelope["error"]["code"], -1);
        assert_eq!(envelope["error"]["message"], "Unknown method: does_not_exist");
    }

    #[test]
    fn object_shaped_string_result_is_reparsed_as_json() {
        let envelope = response_envelope(
            Value::from(1),
            Ok(r#"{"ok":true}"#.to_string()),
            Duration::from_millis(5),
        );
        assert_eq!(envelope["result"]["ok"], true);
        assert_eq!(envelope["processing_time_ms"], 5);
    }

    #[test]
    fn empty_string_result_becomes_the_documented_placeholder() {
        let envelope = response_envelope(Value::from(1), Ok(String::new()), Duration::from_millis(0));
        assert_eq!(envelope["result"], "Operation completed successfully");
    }

    #[test]
    fn plain_string_result_is_embedded_as_a_string() {
        let envelope = response_envelope(Value::from(1), Ok("done".to_string()), Duration::from_millis(0));
        assert_eq!(envelope["result"], "done");
    }

    #[test]
    fn missing_or_malformed_id_normalizes_to_unknown() {
        assert_eq!(normalize_id(Value::Null), Value::String("unknown".to_string()));
        assert_eq!(normalize_id(Value::Bool(true)), Value::String("unknown".to_string()));
        assert_eq!(normalize_id(Value::from(7)), Value::from(7));
        assert_eq!(normalize_id(Value::String("x".to_string())), Value::String("x".to_string()));
    }

    #[test]
    fn authority_parse_defaults_unknown_values_to_guest() {
        assert_eq!(Authority::parse(Some("admin")), Authority::Admin);
        assert_eq!(Authority::parse(Some("bogus")), Authority::Guest);
        assert_eq!(Authority::parse(None), Authority::Guest);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn registered_method_runs_and_clears_the_inflight_set() {
        let pool = Arc::new(WorkerPool::new());
        let (broker, _eventloop) = connected_broker();
        let processor = Arc::new(RequestProcessor::new(
            Arc::clone(&pool),
            broker,
            tokio::runtime::Handle::current(),
            "backend-datalink/gateway/response",
        ));
        processor.register_method("ping", |_params, _authority| Ok("pong".to_string()));

        processor
            .process_value(serde_json::json!({
                "jsonrpc": "2.0",
                "id": "t-1",
                "method": "ping",
                "params": {},
            }))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.inflight_count(), 0);
        pool.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_envelope_is_rejected_without_dispatch() {
        let pool = Arc::new(WorkerPool::new());
        let (broker, _eventloop) = connected_broker();
        let processor = RequestProcessor::new(
            pool,
            broker,
            tokio::runtime::Handle::current(),
            "backend-datalink/gateway/response",
        );

        processor
            .process_value(serde_json::json!({"jsonrpc": "1.0", "method": "ping", "params": {}}))
            .unwrap();
        assert_eq!(processor.inflight_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_blocks_new_dispatches() {
        let pool = Arc::new(WorkerPool::new());
        let (broker, _eventloop) = connected_broker();
        let processor = RequestProcessor::new(
            pool.clone(),
            broker,
            tokio::runtime::Handle::current(),
            "backend-datalink/gateway/response",
        );
        processor.shutdown();
        processor
            .process_value(serde_json::json!({
                "jsonrpc": "2.0",
                "id": "t-2",
                "method": "ping",
                "params": {},
            }))
            .unwrap();
        assert_eq!(processor.inflight_count(), 0);
        pool.shutdown();
    }
}
