//! Inbound PUBLISH deduplication (spec §4.3 "Deduplication of inbound
//! PUBLISH"). Per-client sliding window, not process-wide static storage
//! (§9 open question, resolved per-instance — see DESIGN.md).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Suppresses a re-delivered `(mid, topic)` pair seen within the
/// configured window.
pub struct Dedup {
    window: Duration,
    seen: Mutex<HashMap<(u16, String), Instant>>,
}

impl Dedup {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `(mid, topic)` was already seen within the window
    /// (caller should suppress handler invocation but still ACK), `false`
    /// otherwise (and records it as seen).
    pub fn is_duplicate(&self, mid: u16, topic: &str) -> bool {
        let key = (mid, topic.to_string());
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap();
        seen.retain(|_, t| now.duration_since(*t) < self.window);
        if seen.contains_key(&key) {
            true
        } else {
            seen.insert(key, now);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_repeat_within_window() {
        let dedup = Dedup::new(Duration::from_millis(50));
        assert!(!dedup.is_duplicate(1, "a/b"));
        assert!(dedup.is_duplicate(1, "a/b"));
    }

    #[test]
    fn allows_repeat_after_window_elapses() {
        let dedup = Dedup::new(Duration::from_millis(10));
        assert!(!dedup.is_duplicate(1, "a/b"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!dedup.is_duplicate(1, "a/b"));
    }

    #[test]
    fn distinguishes_distinct_topics_with_same_mid() {
        let dedup = Dedup::new(Duration::from_secs(2));
        assert!(!dedup.is_duplicate(1, "a/b"));
        assert!(!dedup.is_duplicate(1, "c/d"));
    }
}
