/// Wrapped-key record model.
///
/// Records are plain byte blobs with a nonce and a small JSON meta
/// document; the id encodes the owner and role (`mk_pin_<uid>`,
/// `dek_<uid>`, ...). Plaintext keys never appear here.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRecordType {
    DataEncryptionKey,
    MasterKeyPin,
    MasterKeyFido,
    Fido2Credential,
    Recovery,
}

impl KeyRecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataEncryptionKey => "data_encryption_key",
            Self::MasterKeyPin => "master_key_pin",
            Self::MasterKeyFido => "master_key_fido",
            Self::Fido2Credential => "fido2_credential",
            Self::Recovery => "recovery",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "data_encryption_key" => Some(Self::DataEncryptionKey),
            "master_key_pin" => Some(Self::MasterKeyPin),
            "master_key_fido" => Some(Self::MasterKeyFido),
            "fido2_credential" => Some(Self::Fido2Credential),
            "recovery" => Some(Self::Recovery),
            _ => None,
        }
    }

    /// True for the record types that hold a wrapped master key.
    pub fn is_master_key(&self) -> bool {
        matches!(self, Self::MasterKeyPin | Self::MasterKeyFido)
    }
}

/// A wrapped-key row as stored in the key store.
#[derive(Debug, Clone)]
pub struct WrappedKeyRecord {
    pub id: String,
    pub record_type: KeyRecordType,
    /// Ciphertext (wrapped key) or empty for pure-metadata records.
    pub blob: Vec<u8>,
    /// AEAD nonce; empty for pure-metadata records.
    pub nonce: Vec<u8>,
    pub meta: Option<Value>,
}

impl WrappedKeyRecord {
    /// Deserialize the meta document into a typed schema.
    pub fn meta_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let meta = self
            .meta
            .as_ref()
            .ok_or_else(|| CoreError::Storage(format!("record {} has no meta", self.id)))?;
        serde_json::from_value(meta.clone())
            .map_err(|e| CoreError::Storage(format!("record {} meta: {e}", self.id)))
    }
}

/// Meta for `master_key_pin` records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinMeta {
    /// Argon2id salt, 16 bytes hex-encoded.
    pub salt: String,
}

/// Meta for `data_encryption_key` records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DekMeta {
    pub version: u32,
}

/// Meta for `fido2_credential` records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FidoMeta {
    #[serde(rename = "credentialID")]
    pub credential_id: String,
    /// Serialized credential (public key, policies), base64-encoded.
    #[serde(rename = "credentialPublicKey")]
    pub credential_public_key: String,
    pub counter: u32,
    /// Per-credential KEK salt, 16 bytes hex-encoded.
    pub salt: String,
}

/// Meta for `recovery` records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryMeta {
    /// HKDF salt, 16 bytes hex-encoded.
    pub salt: String,
}

pub fn dek_id(user_id: &str) -> String {
    format!("dek_{user_id}")
}

pub fn mk_pin_id(user_id: &str) -> String {
    format!("mk_pin_{user_id}")
}

pub fn mk_fido_id(user_id: &str) -> String {
    format!("mk_fido_{user_id}")
}

pub fn mk_recovery_id(user_id: &str) -> String {
    format!("mk_recovery_{user_id}")
}

pub fn fido2_credential_id(user_id: &str, credential_id: &str) -> String {
    format!("fido2_{user_id}_{credential_id}")
}

/// Prefix matching every fido2 credential record for a user.
pub fn fido2_prefix(user_id: &str) -> String {
    format!("fido2_{user_id}_")
}
