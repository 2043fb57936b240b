/// Configuration for the confidential storage core.
///
/// All policy constants live here with their production values as
/// defaults. The core is instantiated from one of these; nothing reads
/// process-global state.
use std::time::Duration;

use crate::crypto::kdf::KdfParams;
use crate::ratelimit::RateQuota;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Fixed plaintext chunk size for interaction bodies.
    /// Recorded on every header so the value can change in the future.
    pub chunk_size: usize,
    /// Maximum number of cached master keys.
    pub mk_cache_capacity: usize,
    /// Sliding idle TTL for cached master keys.
    pub mk_cache_ttl: Duration,
    /// Failed PIN attempts before lockout.
    pub pin_lockout_threshold: u32,
    /// How long a locked account stays locked.
    pub pin_lockout_window: Duration,
    /// How recently a WebAuthn user verification must have happened for
    /// privileged operations.
    pub fresh_uv_window: Duration,
    /// Argon2id profile for PIN-derived key-encryption keys.
    pub kdf: KdfParams,
    /// Per-IP quota for unlock endpoints.
    pub unlock_rate: RateQuota,
    /// Per-IP quota for the export endpoint.
    pub export_rate: RateQuota,
    /// Bounded depth of the async capture write queue.
    pub write_queue_depth: usize,
    /// WebAuthn relying-party id (a domain, e.g. "localhost").
    pub rp_id: String,
    /// WebAuthn relying-party origin (a URL, e.g. "http://localhost:8787").
    pub rp_origin: String,
    /// Start with the kill switch engaged.
    pub kill_switch: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            mk_cache_capacity: 100,
            mk_cache_ttl: Duration::from_secs(30 * 60),
            pin_lockout_threshold: 5,
            pin_lockout_window: Duration::from_secs(15 * 60),
            fresh_uv_window: Duration::from_secs(5 * 60),
            kdf: KdfParams::default(),
            unlock_rate: RateQuota {
                max_requests: 5,
                window: Duration::from_secs(60),
            },
            export_rate: RateQuota {
                max_requests: 2,
                window: Duration::from_secs(60),
            },
            write_queue_depth: 1000,
            rp_id: "localhost".to_string(),
            rp_origin: "http://localhost:8787".to_string(),
            kill_switch: false,
        }
    }
}
