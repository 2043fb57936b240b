/// Per-user PIN failure accounting with exponential cost: after the
/// threshold is crossed, every attempt inside the lockout window is
/// rejected before any key derivation runs.
///
/// State is in-memory only; losing it on restart resets counters, which
/// is the conservative direction.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct FailureRecord {
    count: u32,
    last_attempt: Instant,
}

pub struct PinFailureTracker {
    state: Mutex<HashMap<String, FailureRecord>>,
    threshold: u32,
    window: Duration,
}

impl PinFailureTracker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            threshold,
            window,
        }
    }

    /// True while the user has hit the failure threshold inside the
    /// lockout window.
    pub fn is_locked(&self, user_id: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match state.get(user_id) {
            Some(record) => {
                record.count >= self.threshold && record.last_attempt.elapsed() < self.window
            }
            None => false,
        }
    }

    /// Record a failed attempt. A failure after the window has fully
    /// elapsed starts a fresh count.
    pub fn record_failure(&self, user_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();

        let record = state.entry(user_id.to_string()).or_insert(FailureRecord {
            count: 0,
            last_attempt: now,
        });

        if now.duration_since(record.last_attempt) >= self.window {
            record.count = 0;
        }
        record.count += 1;
        record.last_attempt = now;

        if record.count >= self.threshold {
            tracing::warn!(%user_id, failures = record.count, "PIN lockout engaged");
        }
    }

    /// Clear the counter after a successful unlock.
    pub fn clear(&self, user_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.remove(user_id);
    }

    #[cfg(test)]
    fn failure_count(&self, user_id: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state.get(user_id).map(|r| r.count).unwrap_or(0)
    }
}
