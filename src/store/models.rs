/// Row types for captured interactions.
///
/// Headers carry everything needed to re-derive the interaction key
/// (given an unlocked DEK) and to verify blob integrity; blobs are
/// sealed chunks, one row each.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An interaction header. Immutable after capture.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InteractionHeader {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    /// Model name as reported by the upstream provider.
    pub model: Option<String>,
    pub tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    /// DEK version in effect when the body was sealed. Bound into every
    /// chunk's AAD.
    pub cipher_key_version: i64,
    /// Caller-supplied request hash, used for dedup upstream.
    pub request_fingerprint: Option<String>,
    /// HKDF salt for the interaction key, 24 bytes hex-encoded.
    pub key_nonce: String,
    pub chunk_count: i64,
    /// Plaintext length in bytes.
    pub byte_count: i64,
    /// Plaintext chunk size used at capture time.
    pub chunk_size: i64,
    /// True when the upstream capture bounded the body length.
    pub truncated: bool,
}

/// One sealed chunk of an interaction body.
#[derive(Debug, Clone, FromRow)]
pub struct CipherBlob {
    pub id: String,
    pub interaction_id: String,
    pub chunk_index: i64,
    /// AEAD nonce, hex-encoded.
    pub nonce: String,
    pub ciphertext: Vec<u8>,
}
