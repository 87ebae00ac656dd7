//! Throttle for automatic update detection

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Per-device earliest time of the next automatic check
pub struct DetectThrottle {
    interval: Duration,
    next_allowed: Mutex<HashMap<String, Instant>>,
}

impl DetectThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_allowed: Mutex::new(HashMap::new()),
        }
    }

    pub fn should_detect(&self, connect_id: &str) -> bool {
        match self.lock().get(connect_id) {
            Some(next) => Instant::now() >= *next,
            None => true,
        }
    }

    /// Record a check now; the next one is due after the interval
    pub fn mark_detected(&self, connect_id: &str) {
        self.delay(connect_id, self.interval);
    }

    /// Postpone the next check by `delay` from now
    pub fn delay(&self, connect_id: &str, delay: Duration) {
        debug!(connect_id = %connect_id, delay_secs = delay.as_secs(), "Delaying update detection");
        self.lock()
            .insert(connect_id.to_string(), Instant::now() + delay);
    }

    /// Allow the next check right away
    pub fn reset(&self, connect_id: &str) {
        self.lock().remove(connect_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.next_allowed.lock().unwrap_or_else(|e| e.into_inner())
    }
}
