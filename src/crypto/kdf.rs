/// Key derivation: Argon2id for PIN stretching, HKDF-SHA256 for
/// everything derived from existing key material.
///
/// The Argon2id profile is t=3, m=128 MiB, p=1 and produces a 256-bit
/// key from a PIN and a 16-byte salt. The profile is carried in
/// `KdfParams` so tests can substitute a fast one; the default is the
/// production profile and must not be weakened.
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{CoreError, Result};

pub const SALT_LEN: usize = 16;

/// Argon2id cost profile.
#[derive(Debug, Clone, Copy)]
pub struct KdfParams {
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 131_072, // 128 MiB
            time_cost: 3,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Weak profile for tests only. Never use outside a test harness.
    pub fn fast_insecure() -> Self {
        Self {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

/// Generate a random 16-byte salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 32-byte key from a low-entropy secret using Argon2id.
pub fn argon2id(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<SensitiveBytes32> {
    let params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| CoreError::KeyDerivation(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = [0u8; 32];
    argon2
        .hash_password_into(secret, salt, &mut output)
        .map_err(|e| CoreError::KeyDerivation(e.to_string()))?;

    Ok(SensitiveBytes32::new(output))
}

/// HKDF-SHA256 with an explicit salt and info label, producing 32 bytes.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8]) -> SensitiveBytes32 {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut output = [0u8; 32];
    let Ok(()) = hkdf.expand(info, &mut output) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    SensitiveBytes32::new(output)
}
