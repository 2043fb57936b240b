/// In-memory sliding-window rate limiting for the unlock and export
/// endpoints.
///
/// Keys are attacker-controlled header strings used only for bucketing,
/// so the limiter caps how many it tracks and prunes expired buckets
/// periodically. State is lost on restart, which is acceptable here.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;

use crate::error::{CoreError, Result};

const CLEANUP_INTERVAL: u64 = 100;
const MAX_TRACKED_KEYS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct RateQuota {
    pub max_requests: u32,
    pub window: Duration,
}

pub struct RateLimiter {
    quota: RateQuota,
    state: Mutex<HashMap<String, Vec<Instant>>>,
    request_count: AtomicU64,
}

impl RateLimiter {
    pub fn new(quota: RateQuota) -> Self {
        Self {
            quota,
            state: Mutex::new(HashMap::new()),
            request_count: AtomicU64::new(0),
        }
    }

    /// Record a request for `key`, or reject it with `RateLimited` when
    /// the quota for the current window is spent.
    pub fn check(&self, key: &str) -> Result<()> {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.quota.window).unwrap_or(now);

        let count = self.request_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % CLEANUP_INTERVAL == 0 {
            self.cleanup();
        }

        let mut state = self.lock();

        // Bound memory against key spoofing: prune, then refuse brand
        // new keys if the table is still full.
        if !state.contains_key(key) && state.len() >= MAX_TRACKED_KEYS {
            state.retain(|_, timestamps| {
                timestamps.retain(|&t| t > cutoff);
                !timestamps.is_empty()
            });
            if state.len() >= MAX_TRACKED_KEYS {
                tracing::warn!(key, "rate limiter key table full, rejecting new key");
                return Err(CoreError::RateLimited);
            }
        }

        let timestamps = state.entry(key.to_string()).or_default();
        timestamps.retain(|&t| t > cutoff);

        if timestamps.len() >= self.quota.max_requests as usize {
            tracing::warn!(
                key,
                requests = timestamps.len(),
                max = self.quota.max_requests,
                "rate limit exceeded"
            );
            return Err(CoreError::RateLimited);
        }

        timestamps.push(now);
        Ok(())
    }

    /// Drop every key with no request inside the window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.quota.window).unwrap_or(now);

        let mut state = self.lock();
        state.retain(|_, timestamps| {
            timestamps.retain(|&t| t > cutoff);
            !timestamps.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Instant>>> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Bucketing key for a request: the first `x-forwarded-for` entry, then
/// `x-real-ip`, then `"unknown"`.
pub fn client_key(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    "unknown".to_string()
}
