//! Pending RPC request table (spec §3 "Pending RPC request", §9 "Shared
//! pending-request table": "a background reaper task periodically expires
//! stale entries ... avoid walking the table on every incoming message").

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::error::BrokerError;

type Callback = Box<dyn FnOnce(Result<serde_json::Value, BrokerError>) + Send>;

struct Entry {
    callback: Callback,
    created_at: Instant,
    timeout: Duration,
}

/// Transaction-ID-keyed table of in-flight calls awaiting a response.
/// "At most one pending entry per transaction ID" (§3 invariant).
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, Entry>>,
}

impl PendingTable {
    pub fn insert(&self, tid: String, timeout: Duration, callback: Callback) {
        self.entries.lock().unwrap().insert(
            tid,
            Entry {
                callback,
                created_at: Instant::now(),
                timeout,
            },
        );
    }

    pub fn remove(&self, tid: &str) -> Option<Callback> {
        self.entries.lock().unwrap().remove(tid).map(|e| e.callback)
    }

    /// Matches an incoming response by transaction ID; on match the entry
    /// is removed and the callback invoked exactly once (§4.3 step 4, §8
    /// "exactly one of {response callback, timeout callback} fires").
    pub fn complete(&self, tid: &str, result: Result<serde_json::Value, BrokerError>) {
        if let Some(cb) = self.remove(tid) {
            cb(result);
        }
    }

    /// Sweeps entries older than their configured timeout and fires a
    /// timeout callback for each; "an entry never outlives `timeout_ms +
    /// one sweep interval`" (§4.3 step 5).
    pub fn sweep_expired(&self) {
        let expired: Vec<(String, Callback)> = {
            let mut guard = self.entries.lock().unwrap();
            let now = Instant::now();
            let expired_keys: Vec<String> = guard
                .iter()
                .filter(|(_, e)| now.duration_since(e.created_at) >= e.timeout)
                .map(|(k, _)| k.clone())
                .collect();
            expired_keys
                .into_iter()
                .filter_map(|k| guard.remove(&k).map(|e| (k, e.callback)))
                .collect()
        };
        for (_, cb) in expired {
            cb(Err(BrokerError::Timeout));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fires a timeout callback for every still-pending entry; used during
    /// client shutdown so no caller waits forever.
    pub fn fail_all(&self) {
        let all: Vec<Callback> = self
            .entries
            .lock()
            .unwrap()
            .drain()
            .map(|(_, e)| e.callback)
            .collect();
        for cb in all {
            cb(Err(BrokerError::ShuttingDown));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn response_and_timeout_each_fire_exactly_once() {
        let table = PendingTable::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let f2 = Arc::clone(&fired);
        table.insert(
            "tid-1".to_string(),
            Duration::from_millis(10),
            Box::new(move |_| {
                f2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        table.complete("tid-1", Ok(serde_json::json!({"ok": true})));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Second completion for the same tid is a no-op: already removed.
        table.complete("tid-1", Ok(serde_json::json!(null)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sweep_expires_stale_entries_once() {
        let table = PendingTable::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let f2 = Arc::clone(&fired);
        table.insert(
            "tid-2".to_string(),
            Duration::from_millis(1),
            Box::new(move |r| {
                assert!(matches!(r, Err(BrokerError::Timeout)));
                f2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        std::thread::sleep(Duration::from_millis(5));
        table.sweep_expired();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }
}
