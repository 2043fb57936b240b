/// XChaCha20-Poly1305 AEAD for wrapped keys and interaction chunks.
///
/// The 24-byte nonce of XChaCha20 is large enough for random generation
/// without practical collision risk, so every seal draws a fresh nonce
/// from the OS RNG. Nonces are caller-visible and persisted next to the
/// ciphertext they belong to.
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{CoreError, Result};

pub const NONCE_LEN: usize = 24;
pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;

/// Generate a random 256-bit symmetric key.
pub fn generate_key() -> SensitiveBytes32 {
    let mut key = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    SensitiveBytes32::new(key)
}

/// Generate a random 24-byte nonce for XChaCha20-Poly1305.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Fill an arbitrary-length buffer with cryptographically random bytes.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut out);
    out
}

/// Encrypt plaintext with XChaCha20-Poly1305 under a fresh random nonce.
///
/// Returns (nonce, ciphertext_with_tag). The AAD is authenticated but
/// not encrypted.
pub fn encrypt(
    key: &SensitiveBytes32,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let nonce = generate_nonce();
    let ciphertext = encrypt_with_nonce(key, &nonce, plaintext, aad)?;
    Ok((nonce, ciphertext))
}

/// Encrypt with a caller-supplied nonce. The nonce MUST be unique per
/// (key, message).
pub fn encrypt_with_nonce(
    key: &SensitiveBytes32,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| CoreError::Encryption(e.to_string()))?;

    let xnonce = XNonce::from_slice(nonce);

    cipher
        .encrypt(
            xnonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CoreError::Encryption(e.to_string()))
}

/// Decrypt ciphertext with XChaCha20-Poly1305.
///
/// Any tag mismatch (wrong key, wrong nonce, altered ciphertext or AAD)
/// comes back as the opaque `DecryptFailed`.
pub fn decrypt(
    key: &SensitiveBytes32,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CoreError::DecryptFailed)?;

    let xnonce = XNonce::from_slice(nonce);

    cipher
        .decrypt(
            xnonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CoreError::DecryptFailed)
}
