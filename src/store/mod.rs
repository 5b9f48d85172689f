//! Embedded relational store (external collaborator, SPEC_FULL.md), a
//! thin façade over `rusqlite` grounded verbatim on
//! `database_manager.h`/`database_manager.cpp`'s schema and upsert
//! semantics: append-only `connections_log`/`messages` tables and a
//! category-keyed `dashboard_data` table addressed through
//! `put(category, json)` / `get(category)`.
//!
//! `rusqlite` (bundled) is enrichment: no pack repository persists
//! anything relationally, but it is the natural embedded-SQL crate for a
//! single-process Rust service and matches the original's single-file
//! SQLite database exactly.

mod error;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

pub use error::{Result, StoreError};

/// Direction of a logged message (`database_manager.cpp`'s `direction`
/// column, `'in'` or `'out'`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

/// The embedded store. Every method is a no-op success when `enabled` is
/// false, or when the specific `log_connections`/`log_messages` switch is
/// off, mirroring `DatabaseManager::logConnection`'s early-return (§
/// "silently no-op, return true if disabled").
pub struct Store {
    conn: Mutex<Connection>,
    log_connections: bool,
    log_messages: bool,
}

impl Store {
    /// Opens (creating if absent) the database at `path`, enables foreign
    /// keys, and creates the schema if it's new (`initialize()` /
    /// `createTables()`).
    pub fn open(path: &Path, log_connections: bool, log_messages: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            log_connections,
            log_messages,
        })
    }

    /// In-memory store for tests and for a disabled `database.enabled`
    /// configuration.
    pub fn open_in_memory(log_connections: bool, log_messages: bool) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            log_connections,
            log_messages,
        })
    }

    /// `logConnection`: inserts a new `connections_log` row with
    /// `status = 'connected'`.
    pub fn log_connection(&self, connection_id: &str, client_ip: &str) -> Result<()> {
        if !self.log_connections {
            return Ok(());
        }
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.lock().unwrap().execute(
            "INSERT INTO connections_log (connection_id, client_ip, status, connected_at) \
             VALUES (?1, ?2, 'connected', ?3)",
            params![connection_id, client_ip, now],
        )?;
        Ok(())
    }

    /// `logDisconnection`: marks the most recent matching row
    /// `status = 'disconnected'` and stamps `disconnected_at`.
    pub fn log_disconnection(&self, connection_id: &str) -> Result<()> {
        if !self.log_connections {
            return Ok(());
        }
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.lock().unwrap().execute(
            "UPDATE connections_log SET status = 'disconnected', disconnected_at = ?1 \
             WHERE connection_id = ?2 AND status = 'connected'",
            params![now, connection_id],
        )?;
        Ok(())
    }

    /// `logMessage`: appends a row to the `messages` table.
    pub fn log_message(&self, connection_id: &str, direction: Direction, text: &str) -> Result<()> {
        if !self.log_messages {
            return Ok(());
        }
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.lock().unwrap().execute(
            "INSERT INTO messages (connection_id, direction, message_text, timestamp) \
             VALUES (?1, ?2, ?3, ?4)",
            params![connection_id, direction.as_str(), text, now],
        )?;
        Ok(())
    }

    /// `getActiveConnectionCount`.
    pub fn active_connection_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM connections_log WHERE status = 'connected'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// `updateDashboardData`: `INSERT OR REPLACE INTO dashboard_data
    /// (category, data_json, updated_at) VALUES (?, ?, ?)`, i.e. an
    /// upsert keyed on the `category UNIQUE` column.
    pub fn put(&self, category: &str, json: &Value) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let body = serde_json::to_string(json)?;
        self.conn.lock().unwrap().execute(
            "INSERT OR REPLACE INTO dashboard_data (category, data_json, updated_at) \
             VALUES (?1, ?2, ?3)",
            params![category, body, now],
        )?;
        Ok(())
    }

    /// `getDashboardData`: returns `{}` if the category has never been
    /// written (not found), matching the original's default.
    pub fn get(&self, category: &str) -> Result<Value> {
        let conn = self.conn.lock().unwrap();
        let body: Option<String> = conn
            .query_row(
                "SELECT data_json FROM dashboard_data WHERE category = ?1",
                params![category],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Ok(serde_json::json!({})),
        }
    }
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS connections_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id TEXT NOT NULL,
            client_ip TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'connected',
            connected_at TEXT NOT NULL,
            disconnected_at TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX IF NOT EXISTS idx_connections_log_connection_id ON connections_log (connection_id);
        CREATE INDEX IF NOT EXISTS idx_connections_log_status ON connections_log (status);
        CREATE INDEX IF NOT EXISTS idx_connections_log_connected_at ON connections_log (connected_at);

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id TEXT NOT NULL,
            direction TEXT NOT NULL,
            message_text TEXT,
            timestamp TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (connection_id) REFERENCES connections_log(connection_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages (timestamp);

        CREATE TABLE IF NOT EXISTS dashboard_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            category TEXT NOT NULL UNIQUE,
            data_json TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX IF NOT EXISTS idx_dashboard_data_category ON dashboard_data (category);
        CREATE INDEX IF NOT EXISTS idx_dashboard_data_updated_at ON dashboard_data (updated_at);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_category_returns_empty_object() {
        let store = Store::open_in_memory(true, true).unwrap();
        assert_eq!(store.get("system").unwrap(), serde_json::json!({}));
    }

    #[test]
    fn put_then_get_roundtrips_and_upserts() {
        let store = Store::open_in_memory(true, true).unwrap();
        store.put("ram", &serde_json::json!({"usage_percent": 12.0})).unwrap();
        assert_eq!(store.get("ram").unwrap()["usage_percent"], 12.0);

        store.put("ram", &serde_json::json!({"usage_percent": 40.0})).unwrap();
        assert_eq!(store.get("ram").unwrap()["usage_percent"], 40.0);
    }

    #[test]
    fn connection_lifecycle_updates_active_count() {
        let store = Store::open_in_memory(true, true).unwrap();
        store.log_connection("conn_1", "127.0.0.1").unwrap();
        store.log_connection("conn_2", "127.0.0.1").unwrap();
        assert_eq!(store.active_connection_count().unwrap(), 2);

        store.log_disconnection("conn_1").unwrap();
        assert_eq!(store.active_connection_count().unwrap(), 1);
    }

    #[test]
    fn disabled_connection_logging_is_a_silent_noop() {
        let store = Store::open_in_memory(false, true).unwrap();
        store.log_connection("conn_1", "127.0.0.1").unwrap();
        assert_eq!(store.active_connection_count().unwrap(), 0);
    }

    #[test]
    fn disabled_message_logging_does_not_error() {
        let store = Store::open_in_memory(true, false).unwrap();
        store.log_connection("conn_1", "127.0.0.1").unwrap();
        store
            .log_message("conn_1", Direction::In, "{}")
            .expect("disabled message logging is a no-op, not an error");
    }
}
