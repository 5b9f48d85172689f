//! Connection record and registry (spec §3 "Connection record").

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Opaque connection identifier: `conn_<millisecond-epoch>_<6-digit-rand>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ConnectionId {
    /// Uniqueness is probabilistic (§4.2); collision is a best-effort
    /// concern, not guarded against here.
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix: u32 = rand::thread_rng().gen_range(100_000..=999_999);
        Self(format!("conn_{millis}_{suffix}"))
    }
}

/// One live accepted socket. The registry owns the sender half of an
/// unbounded channel draining into the connection's writer task; actual
/// socket I/O lives entirely on that task.
pub struct Connection {
    pub id: ConnectionId,
    pub peer_addr: String,
    pub created_at: i64,
    sender: mpsc::UnboundedSender<Message>,
}

impl Connection {
    pub fn send_text(&self, text: String) -> Result<(), super::error::ServerError> {
        self.sender
            .send(Message::Text(text))
            .map_err(|e| super::error::ServerError::Send(e.to_string()))
    }
}

/// Per-connection map behind one mutex (§5 "Shared resources").
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn insert(
        &self,
        peer_addr: String,
        sender: mpsc::UnboundedSender<Message>,
    ) -> ConnectionId {
        let id = ConnectionId::generate();
        let conn = Connection {
            id: id.clone(),
            peer_addr,
            created_at: chrono::Utc::now().timestamp(),
            sender,
        };
        self.connections.lock().unwrap().insert(id.clone(), conn);
        id
    }

    pub fn remove(&self, id: &ConnectionId) {
        self.connections.lock().unwrap().remove(id);
    }

    pub fn send(&self, id: &ConnectionId, text: String) -> super::error::Result<()> {
        let guard = self.connections.lock().unwrap();
        let conn = guard.get(id).ok_or(super::error::ServerError::NotFound)?;
        conn.send_text(text)
    }

    /// Broadcasts to every connection; a failed send removes that entry but
    /// does not abort the broadcast (§4.2).
    pub fn broadcast(&self, text: String) {
        let dead: Vec<ConnectionId> = {
            let guard = self.connections.lock().unwrap();
            guard
                .values()
                .filter_map(|c| {
                    if c.send_text(text.clone()).is_err() {
                        Some(c.id.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };
        if !dead.is_empty() {
            let mut guard = self.connections.lock().unwrap();
            for id in dead {
                guard.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_ids(&self) -> Vec<ConnectionId> {
        self.connections.lock().unwrap().keys().cloned().collect()
    }
}
