//! Wire message shapes for the dashboard protocol (spec §4.2).

use serde::Serialize;
use serde_json::Value;

use crate::constants::{DEFAULT_DASHBOARD_CATEGORIES, SERVER_NAME};

/// Whole-seconds UNIX time, used for every outbound `timestamp` field.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Serialize)]
pub struct Welcome<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub connection_id: &'a str,
    pub timestamp: i64,
}

impl<'a> Welcome<'a> {
    pub fn new(connection_id: &'a str) -> Self {
        Self {
            kind: "welcome",
            connection_id,
            timestamp: now_unix(),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
    pub timestamp: i64,
}

impl ErrorMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: "error",
            message: message.into(),
            timestamp: now_unix(),
        }
    }
}

#[derive(Serialize)]
pub struct Echo {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub original: Value,
    pub timestamp: i64,
    pub server: &'static str,
}

impl Echo {
    pub fn new(original: Value) -> Self {
        Self {
            kind: "echo",
            original,
            timestamp: now_unix(),
            server: SERVER_NAME,
        }
    }
}

#[derive(Serialize)]
pub struct DashboardData {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: serde_json::Map<String, Value>,
    pub timestamp: i64,
}

impl DashboardData {
    pub fn new(data: serde_json::Map<String, Value>) -> Self {
        Self {
            kind: "dashboard_data",
            data,
            timestamp: now_unix(),
        }
    }
}

#[derive(Serialize)]
pub struct DashboardUpdate<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub category: &'a str,
    pub data: Value,
    pub timestamp: i64,
}

impl<'a> DashboardUpdate<'a> {
    pub fn new(category: &'a str, data: Value) -> Self {
        Self {
            kind: "dashboard_update",
            category,
            data,
            timestamp: now_unix(),
        }
    }
}

#[derive(Serialize)]
pub struct SubscriptionConfirmed {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: i64,
}

impl Default for SubscriptionConfirmed {
    fn default() -> Self {
        Self {
            kind: "subscription_confirmed",
            timestamp: now_unix(),
        }
    }
}

/// Categories returned by `get_dashboard_data` when the request omits
/// `categories`.
pub fn default_categories() -> Vec<String> {
    DEFAULT_DASHBOARD_CATEGORIES
        .iter()
        .map(|s| s.to_string())
        .collect()
}
