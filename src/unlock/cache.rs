/// In-memory master-key cache.
///
/// Capacity-bounded with oldest-inserted eviction, and a sliding idle
/// TTL refreshed on every read. Expired entries are dropped on access;
/// no background sweep. Keys zeroize on eviction (the wrapper zeroizes
/// on drop) and the whole cache dies with the process.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::crypto::sensitive::SensitiveBytes32;

struct CacheEntry {
    key: SensitiveBytes32,
    expires_at: Instant,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
}

pub struct MasterKeyCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

impl MasterKeyCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
            ttl,
        }
    }

    /// Cache a master key for a user, replacing any previous entry.
    /// Evicts the oldest-inserted entry when full.
    pub fn insert(&self, user_id: &str, key: SensitiveBytes32) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        if inner.entries.contains_key(user_id) {
            inner.order.retain(|id| id != user_id);
        } else if inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                tracing::debug!(user_id = %oldest, "master key cache full, evicting oldest entry");
                inner.entries.remove(&oldest);
            }
        }

        inner.entries.insert(
            user_id.to_string(),
            CacheEntry {
                key,
                expires_at: Instant::now() + self.ttl,
            },
        );
        inner.order.push_back(user_id.to_string());
    }

    /// Read a cached key, refreshing its idle TTL. Expired entries are
    /// removed and read as a miss.
    pub fn get(&self, user_id: &str) -> Option<SensitiveBytes32> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let now = Instant::now();
        if let Some(entry) = inner.entries.get_mut(user_id) {
            if entry.expires_at > now {
                entry.expires_at = now + self.ttl;
                return Some(entry.key.clone());
            }
        } else {
            return None;
        }

        // Present but past its deadline: evict on access.
        inner.entries.remove(user_id);
        inner.order.retain(|id| id != user_id);
        tracing::debug!(%user_id, "master key cache entry expired");
        None
    }

    /// Evict (and zeroize) a user's entry, e.g. on logout.
    pub fn remove(&self, user_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.entries.remove(user_id);
        inner.order.retain(|id| id != user_id);
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
