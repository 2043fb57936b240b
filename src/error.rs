use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// No master key is cached for the user; unlock first.
    #[error("no unlocked master key")]
    Locked,

    /// Too many failed PIN attempts inside the lockout window.
    #[error("account temporarily locked")]
    AccountLocked,

    /// PIN or WebAuthn assertion rejected.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// AEAD tag mismatch: wrong key, wrong nonce, or altered AAD.
    #[error("decryption failed")]
    DecryptFailed,

    /// Stored ciphertext or header no longer authenticates.
    #[error("interaction data failed authentication: {0}")]
    Tampered(String),

    #[error("record already exists: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("too many requests")]
    RateLimited,

    /// Fresh WebAuthn verification required.
    #[error("forbidden")]
    Forbidden,

    /// Kill switch engaged. Surfaced as a generic message on purpose.
    #[error("service unavailable")]
    ServiceUnavailable,

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("webauthn error: {0}")]
    WebAuthn(String),

    /// Transient persistence failure.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
