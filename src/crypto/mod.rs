/// Thin facade over audited crypto crates.
///
/// Everything the core encrypts goes through this module:
/// XChaCha20-Poly1305 for AEAD, Argon2id for PIN stretching,
/// HKDF-SHA256 for key derivation, and zeroize-on-drop wrappers for
/// any key material held in memory.
pub mod aead;
pub mod kdf;
pub mod sensitive;
