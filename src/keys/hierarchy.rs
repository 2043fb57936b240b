/// Key wrapping and derivation.
///
/// Wrapping is plain AEAD under a fresh 24-byte nonce with no AAD; the
/// enclosing record already carries type and version. Derivations:
///
/// - interaction key: HKDF-SHA256(ikm=DEK, salt=key_nonce, "coldproxy/v1")
/// - PIN KEK:         Argon2id(pin, salt)
/// - WebAuthn KEK:    HKDF-SHA256(challenge || credentialId || signature,
///                    salt, "ccflare-webauthn-kek")
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;

use crate::crypto::aead::{self, NONCE_LEN};
use crate::crypto::kdf::{self, KdfParams};
use crate::crypto::sensitive::{SensitiveBytes32, SensitiveVec};
use crate::error::{CoreError, Result};

/// Domain label for per-interaction key derivation.
pub const INTERACTION_KEY_INFO: &[u8] = b"coldproxy/v1";

/// Domain label for the WebAuthn-derived key-encryption key.
pub const WEBAUTHN_KEK_INFO: &[u8] = b"ccflare-webauthn-kek";

/// Wrap a 32-byte key under a wrapping key. Returns (ciphertext, nonce).
pub fn wrap_key(
    key: &SensitiveBytes32,
    wrapping_key: &SensitiveBytes32,
) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
    let (nonce, ciphertext) = aead::encrypt(wrapping_key, key.as_bytes(), b"")?;
    Ok((ciphertext, nonce))
}

/// Unwrap a previously wrapped key.
pub fn unwrap_key(
    blob: &[u8],
    nonce: &[u8],
    wrapping_key: &SensitiveBytes32,
) -> Result<SensitiveBytes32> {
    let nonce: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| CoreError::DecryptFailed)?;
    let plaintext = SensitiveVec::new(aead::decrypt(wrapping_key, &nonce, blob, b"")?);
    SensitiveBytes32::from_slice(plaintext.as_bytes()).ok_or(CoreError::DecryptFailed)
}

/// Derive the per-interaction key from the DEK and the interaction's
/// stored key nonce. Reproducible given the DEK.
pub fn derive_interaction_key(
    dek: &SensitiveBytes32,
    key_nonce: &[u8; NONCE_LEN],
) -> SensitiveBytes32 {
    kdf::hkdf_sha256(dek.as_bytes(), key_nonce, INTERACTION_KEY_INFO)
}

/// Derive a key-encryption key from a PIN with Argon2id.
pub fn derive_kek_from_pin(pin: &str, salt: &[u8], params: &KdfParams) -> Result<SensitiveBytes32> {
    kdf::argon2id(pin.as_bytes(), salt, params)
}

#[derive(Deserialize)]
struct ClientData {
    challenge: String,
}

/// Derive a key-encryption key from WebAuthn ceremony material.
///
/// The challenge is extracted from clientDataJSON (base64url, as sent
/// on the wire); credentialId and signature arrive as raw bytes. All
/// three are treated as opaque bytes and concatenated in this exact
/// order into the HKDF input.
pub fn derive_kek_from_webauthn(
    client_data_json: &[u8],
    credential_id: &[u8],
    signature: &[u8],
    salt: &[u8],
) -> Result<SensitiveBytes32> {
    let client_data: ClientData = serde_json::from_slice(client_data_json)
        .map_err(|e| CoreError::KeyDerivation(format!("clientDataJSON: {e}")))?;

    let challenge = URL_SAFE_NO_PAD
        .decode(client_data.challenge.trim_end_matches('='))
        .map_err(|e| CoreError::KeyDerivation(format!("challenge: {e}")))?;

    let mut ikm = Vec::with_capacity(challenge.len() + credential_id.len() + signature.len());
    ikm.extend_from_slice(&challenge);
    ikm.extend_from_slice(credential_id);
    ikm.extend_from_slice(signature);

    let kek = kdf::hkdf_sha256(&ikm, salt, WEBAUTHN_KEK_INFO);

    use zeroize::Zeroize;
    ikm.zeroize();

    Ok(kek)
}
