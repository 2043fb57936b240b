/// Wrapped-key records and the key hierarchy built on them.
///
/// A per-user Master Key (MK) wraps the user's Data Encryption Key
/// (DEK); the MK itself is stored wrapped under key-encryption keys
/// derived from a PIN, a WebAuthn ceremony, or a recovery code. Every
/// captured interaction gets its own key derived from the DEK.
pub mod hierarchy;
pub mod record;
