//! Throttled operator notifications for risk vetoes and execution faults.
//!
//! Each (kind, key) combination is reported at most once per interval so a
//! pair that keeps tripping the same limit on every tick does not flood the
//! log. The underlying events still show up at debug level.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const THROTTLE_INTERVAL: Duration = Duration::from_secs(300);

static ALERT_SINK: Lazy<AlertSink> = Lazy::new(AlertSink::new);

pub fn notify_veto(pair_key: &str, reason: &str) {
    ALERT_SINK.notify("VETO", pair_key, reason);
}

pub fn notify_drop(context: &str, detail: &str) {
    ALERT_SINK.notify("DROP", context, detail);
}

pub fn notify_execution(pair_key: &str, detail: &str) {
    ALERT_SINK.notify("EXEC", pair_key, detail);
}

struct AlertSink {
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl AlertSink {
    fn new() -> Self {
        Self {
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn notify(&self, kind: &str, key: &str, detail: &str) {
        let slot = format!("{}:{}", kind, key);
        if self.admit(&slot, Instant::now()) {
            log::warn!("[ALERT] {} {}: {}", kind, key, detail);
        } else {
            log::debug!("[ALERT] {} {} (throttled): {}", kind, key, detail);
        }
    }

    /// Record the send time for `slot` unless one inside the throttle
    /// interval already exists.
    fn admit(&self, slot: &str, now: Instant) -> bool {
        let mut last_sent = match self.last_sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match last_sent.get(slot) {
            Some(prev) if now.duration_since(*prev) < THROTTLE_INTERVAL => false,
            _ => {
                last_sent.insert(slot.to_string(), now);
                true
            }
        }
    }
}
