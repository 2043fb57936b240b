/// Provisioning and key-lifecycle operations.
///
/// First-time setup mints a master key and a data-encryption key and
/// stores them wrapped (`dek_<uid>` under MK, `mk_pin_<uid>` under a
/// PIN-derived KEK). Later operations add WebAuthn and recovery-code
/// wrappers, rotate the master key, or recover it from the one-time
/// code. Multi-record writes go through the key store's atomic batch.
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use data_encoding::BASE32_NOPAD;
use webauthn_rs::prelude::{
    CreationChallengeResponse, CredentialID, PasskeyRegistration, RegisterPublicKeyCredential,
    Webauthn,
};

use crate::config::CoreConfig;
use crate::crypto::aead::generate_key;
use crate::crypto::kdf::{self, KdfParams, SALT_LEN};
use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{CoreError, Result};
use crate::keys::hierarchy;
use crate::keys::record::{
    self, DekMeta, FidoMeta, KeyRecordType, PinMeta, RecoveryMeta, WrappedKeyRecord,
};
use crate::store::keys::KeyWriteOp;
use crate::store::{self, Database};
use crate::unlock::{encode_passkey, UnlockService};

/// Domain label for recovery-code key derivation.
const RECOVERY_KEK_INFO: &[u8] = b"coldproxy/recovery";

pub struct SetupService {
    db: Database,
    unlock: Arc<UnlockService>,
    webauthn: Arc<Webauthn>,
    kdf: KdfParams,
}

impl SetupService {
    pub fn new(
        db: Database,
        unlock: Arc<UnlockService>,
        webauthn: Arc<Webauthn>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            db,
            unlock,
            webauthn,
            kdf: config.kdf,
        }
    }

    /// Provision a user with a PIN.
    ///
    /// First call for a user generates MK and DEK and stores both
    /// wrapped. For an already-provisioned user whose MK is cached
    /// (recovery flow), only the PIN wrapper is re-written; without a
    /// cached MK the call fails with `Conflict`.
    pub async fn set_pin(&self, user_id: &str, pin: &str) -> Result<()> {
        let existing_dek =
            store::keys::find_by_id(self.db.pool(), &record::dek_id(user_id)).await?;

        let salt = kdf::generate_salt();
        let kek = self.derive_pin_kek(pin.to_string(), salt).await?;

        if existing_dek.is_some() {
            let Some(mk) = self.unlock.cached_master_key(user_id) else {
                return Err(CoreError::Conflict(record::dek_id(user_id)));
            };
            let (mk_blob, mk_nonce) = hierarchy::wrap_key(&mk, &kek)?;
            store::keys::apply_atomic(
                self.db.pool(),
                vec![KeyWriteOp::Upsert(mk_pin_record(user_id, mk_blob, mk_nonce, salt))],
            )
            .await?;
            tracing::info!(%user_id, "PIN wrapper re-provisioned");
            return Ok(());
        }

        let mk = generate_key();
        let dek = generate_key();

        let (dek_blob, dek_nonce) = hierarchy::wrap_key(&dek, &mk)?;
        let (mk_blob, mk_nonce) = hierarchy::wrap_key(&mk, &kek)?;

        let dek_record = WrappedKeyRecord {
            id: record::dek_id(user_id),
            record_type: KeyRecordType::DataEncryptionKey,
            blob: dek_blob,
            nonce: dek_nonce.to_vec(),
            meta: Some(serde_json::to_value(DekMeta { version: 1 }).expect("static schema")),
        };

        store::keys::apply_atomic(
            self.db.pool(),
            vec![
                KeyWriteOp::Insert(dek_record),
                KeyWriteOp::Insert(mk_pin_record(user_id, mk_blob, mk_nonce, salt)),
            ],
        )
        .await?;

        tracing::info!(%user_id, "user provisioned with PIN unlock");
        Ok(())
    }

    /// Begin a WebAuthn registration ceremony. The returned state must
    /// be held in the caller's session for
    /// [`Self::finish_webauthn_registration`].
    pub async fn start_webauthn_registration(
        &self,
        user_id: &str,
    ) -> Result<(CreationChallengeResponse, PasskeyRegistration)> {
        let exclude = self.registered_credential_ids(user_id).await?;
        let exclude = if exclude.is_empty() { None } else { Some(exclude) };

        let unique_id = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, user_id.as_bytes());
        self.webauthn
            .start_passkey_registration(unique_id, user_id, user_id, exclude)
            .map_err(|e| CoreError::WebAuthn(e.to_string()))
    }

    /// Verify an attestation, store the credential, and seal the cached
    /// master key under a KEK derived from this ceremony's material.
    /// Requires an unlocked master key.
    pub async fn finish_webauthn_registration(
        &self,
        user_id: &str,
        attestation: &RegisterPublicKeyCredential,
        state: &PasskeyRegistration,
    ) -> Result<()> {
        let mk = self
            .unlock
            .cached_master_key(user_id)
            .ok_or(CoreError::Locked)?;

        let passkey = self
            .webauthn
            .finish_passkey_registration(attestation, state)
            .map_err(|e| CoreError::WebAuthn(e.to_string()))?;

        let cred_b64 = URL_SAFE_NO_PAD.encode(passkey.cred_id());
        let salt = kdf::generate_salt();

        let kek = hierarchy::derive_kek_from_webauthn(
            attestation.response.client_data_json.as_ref(),
            attestation.raw_id.as_ref(),
            attestation.response.attestation_object.as_ref(),
            &salt,
        )?;
        let (mk_blob, mk_nonce) = hierarchy::wrap_key(&mk, &kek)?;

        let meta = FidoMeta {
            credential_id: cred_b64.clone(),
            credential_public_key: encode_passkey(&passkey)?,
            counter: 0,
            salt: hex::encode(salt),
        };

        let cred_record = WrappedKeyRecord {
            id: record::fido2_credential_id(user_id, &cred_b64),
            record_type: KeyRecordType::Fido2Credential,
            blob: Vec::new(),
            nonce: Vec::new(),
            meta: Some(
                serde_json::to_value(&meta)
                    .map_err(|e| CoreError::Storage(format!("fido meta: {e}")))?,
            ),
        };

        let mk_fido_record = WrappedKeyRecord {
            id: record::mk_fido_id(user_id),
            record_type: KeyRecordType::MasterKeyFido,
            blob: mk_blob,
            nonce: mk_nonce.to_vec(),
            meta: Some(serde_json::json!({})),
        };

        store::keys::apply_atomic(
            self.db.pool(),
            vec![
                KeyWriteOp::Insert(cred_record),
                KeyWriteOp::Upsert(mk_fido_record),
            ],
        )
        .await?;

        tracing::info!(%user_id, credential = %cred_b64, "webauthn credential registered");
        Ok(())
    }

    /// Issue a one-time recovery code and store the master key wrapped
    /// under a KEK derived from it. Requires an unlocked master key.
    /// The code is returned exactly once and never persisted.
    pub async fn generate_recovery_code(&self, user_id: &str) -> Result<String> {
        let mk = self
            .unlock
            .cached_master_key(user_id)
            .ok_or(CoreError::Locked)?;

        let secret = crate::crypto::aead::random_bytes(32);
        let salt = kdf::generate_salt();

        let kek = kdf::hkdf_sha256(&secret, &salt, RECOVERY_KEK_INFO);
        let (blob, nonce) = hierarchy::wrap_key(&mk, &kek)?;

        let meta = RecoveryMeta {
            salt: hex::encode(salt),
        };
        let record = WrappedKeyRecord {
            id: record::mk_recovery_id(user_id),
            record_type: KeyRecordType::Recovery,
            blob,
            nonce: nonce.to_vec(),
            meta: Some(
                serde_json::to_value(&meta)
                    .map_err(|e| CoreError::Storage(format!("recovery meta: {e}")))?,
            ),
        };
        store::keys::apply_atomic(self.db.pool(), vec![KeyWriteOp::Upsert(record)]).await?;

        tracing::info!(%user_id, "recovery code issued");
        Ok(format_recovery_code(&secret))
    }

    /// Recover the master key from a recovery code.
    ///
    /// On success the MK is cached and the PIN/WebAuthn wrappers are
    /// dropped so the user must re-provision them. An unknown user or a
    /// wrong code both read as `Ok(false)`.
    pub async fn recover_master_key(&self, user_id: &str, code: &str) -> Result<bool> {
        let Some(record) =
            store::keys::find_by_id(self.db.pool(), &record::mk_recovery_id(user_id)).await?
        else {
            return Ok(false);
        };

        let meta: RecoveryMeta = record.meta_as()?;
        let salt = hex::decode(&meta.salt)
            .map_err(|e| CoreError::Storage(format!("recovery salt: {e}")))?;

        let Some(secret) = parse_recovery_code(code) else {
            return Ok(false);
        };

        let kek = kdf::hkdf_sha256(&secret, &salt, RECOVERY_KEK_INFO);
        let mk = match hierarchy::unwrap_key(&record.blob, &record.nonce, &kek) {
            Ok(mk) => mk,
            Err(CoreError::DecryptFailed) => return Ok(false),
            Err(e) => return Err(e),
        };

        // Drop every credential wrapper plus the spent recovery record:
        // the code is single-use and the old wrappers may be what the
        // user lost control of.
        let fido_creds = self.registered_credential_records(user_id).await?;
        let mut ops = vec![
            KeyWriteOp::Delete(record::mk_pin_id(user_id)),
            KeyWriteOp::Delete(record::mk_fido_id(user_id)),
            KeyWriteOp::Delete(record::mk_recovery_id(user_id)),
        ];
        ops.extend(fido_creds.into_iter().map(KeyWriteOp::Delete));
        store::keys::apply_atomic(self.db.pool(), ops).await?;

        self.unlock.cache_master_key(user_id, mk);
        tracing::warn!(%user_id, "master key recovered via recovery code, wrappers reset");
        Ok(true)
    }

    /// Rotate the user's master key.
    ///
    /// The PIN is required to re-wrap the new MK; the DEK is carried
    /// over unchanged (re-wrapped, version incremented) so existing
    /// ciphertext stays readable. WebAuthn and recovery wrappers cannot
    /// be re-derived without fresh ceremony material and are dropped.
    /// The whole record set is applied in one transaction.
    pub async fn rotate_master_key(&self, user_id: &str, pin: &str) -> Result<()> {
        if self.unlock.cached_master_key(user_id).is_none() {
            return Err(CoreError::Locked);
        }

        let pin_record =
            store::keys::find_by_id(self.db.pool(), &record::mk_pin_id(user_id))
                .await?
                .ok_or_else(|| CoreError::NotFound(record::mk_pin_id(user_id)))?;
        let pin_meta: PinMeta = pin_record.meta_as()?;
        let old_salt: [u8; SALT_LEN] = hex::decode(&pin_meta.salt)
            .map_err(|e| CoreError::Storage(format!("pin salt: {e}")))?
            .try_into()
            .map_err(|_| CoreError::Storage("pin salt length".into()))?;

        let old_kek = self.derive_pin_kek(pin.to_string(), old_salt).await?;
        let mk_old = match hierarchy::unwrap_key(&pin_record.blob, &pin_record.nonce, &old_kek) {
            Ok(mk) => mk,
            Err(CoreError::DecryptFailed) => return Err(CoreError::InvalidCredentials),
            Err(e) => return Err(e),
        };

        let dek_record = store::keys::find_by_id(self.db.pool(), &record::dek_id(user_id))
            .await?
            .ok_or_else(|| CoreError::NotFound(record::dek_id(user_id)))?;
        let dek_meta: DekMeta = dek_record.meta_as()?;
        let dek = hierarchy::unwrap_key(&dek_record.blob, &dek_record.nonce, &mk_old)?;

        let mk_new = generate_key();
        let (dek_blob, dek_nonce) = hierarchy::wrap_key(&dek, &mk_new)?;

        let new_salt = kdf::generate_salt();
        let new_kek = self.derive_pin_kek(pin.to_string(), new_salt).await?;
        let (mk_blob, mk_nonce) = hierarchy::wrap_key(&mk_new, &new_kek)?;

        let new_version = dek_meta.version + 1;
        store::keys::apply_atomic(
            self.db.pool(),
            vec![
                KeyWriteOp::Update {
                    id: record::dek_id(user_id),
                    blob: dek_blob,
                    nonce: dek_nonce.to_vec(),
                    meta: Some(
                        serde_json::to_value(DekMeta {
                            version: new_version,
                        })
                        .expect("static schema"),
                    ),
                },
                KeyWriteOp::Update {
                    id: record::mk_pin_id(user_id),
                    blob: mk_blob,
                    nonce: mk_nonce.to_vec(),
                    meta: Some(
                        serde_json::to_value(PinMeta {
                            salt: hex::encode(new_salt),
                        })
                        .expect("static schema"),
                    ),
                },
                KeyWriteOp::Delete(record::mk_fido_id(user_id)),
                KeyWriteOp::Delete(record::mk_recovery_id(user_id)),
            ],
        )
        .await?;

        self.unlock.cache_master_key(user_id, mk_new);
        tracing::info!(%user_id, dek_version = new_version, "master key rotated");
        Ok(())
    }

    async fn registered_credential_ids(&self, user_id: &str) -> Result<Vec<CredentialID>> {
        let records = store::keys::find_by_type(
            self.db.pool(),
            KeyRecordType::Fido2Credential,
        )
        .await?;

        let prefix = record::fido2_prefix(user_id);
        records
            .iter()
            .filter(|r| r.id.starts_with(&prefix))
            .map(|r| {
                let meta: FidoMeta = r.meta_as()?;
                let bytes = URL_SAFE_NO_PAD
                    .decode(&meta.credential_id)
                    .map_err(|e| CoreError::Storage(format!("credential id: {e}")))?;
                Ok(CredentialID::from(bytes))
            })
            .collect()
    }

    async fn registered_credential_records(&self, user_id: &str) -> Result<Vec<String>> {
        let records = store::keys::find_by_type(
            self.db.pool(),
            KeyRecordType::Fido2Credential,
        )
        .await?;
        let prefix = record::fido2_prefix(user_id);
        Ok(records
            .into_iter()
            .filter(|r| r.id.starts_with(&prefix))
            .map(|r| r.id)
            .collect())
    }

    async fn derive_pin_kek(
        &self,
        pin: String,
        salt: [u8; SALT_LEN],
    ) -> Result<SensitiveBytes32> {
        let params = self.kdf;
        tokio::task::spawn_blocking(move || {
            use zeroize::Zeroize;
            let mut pin = pin;
            let kek = hierarchy::derive_kek_from_pin(&pin, &salt, &params);
            pin.zeroize();
            kek
        })
        .await
        .map_err(|e| CoreError::KeyDerivation(e.to_string()))?
    }
}

fn mk_pin_record(
    user_id: &str,
    blob: Vec<u8>,
    nonce: [u8; 24],
    salt: [u8; SALT_LEN],
) -> WrappedKeyRecord {
    WrappedKeyRecord {
        id: record::mk_pin_id(user_id),
        record_type: KeyRecordType::MasterKeyPin,
        blob,
        nonce: nonce.to_vec(),
        meta: Some(serde_json::json!({ "salt": hex::encode(salt) })),
    }
}

/// Human-readable recovery code: base32, groups of four, dash-separated.
fn format_recovery_code(secret: &[u8]) -> String {
    let encoded = BASE32_NOPAD.encode(secret);
    encoded
        .as_bytes()
        .chunks(4)
        .map(|chunk| std::str::from_utf8(chunk).expect("base32 is ascii"))
        .collect::<Vec<_>>()
        .join("-")
}

/// Normalize and decode a recovery code. Returns `None` for anything
/// that does not decode to 32 bytes.
fn parse_recovery_code(code: &str) -> Option<Vec<u8>> {
    let normalized: String = code
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let secret = BASE32_NOPAD.decode(normalized.as_bytes()).ok()?;
    (secret.len() == 32).then_some(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_code_roundtrip() {
        let secret = crate::crypto::aead::random_bytes(32);
        let code = format_recovery_code(&secret);

        assert!(code.contains('-'));
        assert_eq!(parse_recovery_code(&code).unwrap(), secret);
        // Lowercase and stray whitespace are tolerated.
        let sloppy = format!(" {} ", code.to_ascii_lowercase());
        assert_eq!(parse_recovery_code(&sloppy).unwrap(), secret);
    }

    #[test]
    fn recovery_code_rejects_garbage() {
        assert!(parse_recovery_code("not a code").is_none());
        assert!(parse_recovery_code("").is_none());
        // Valid base32 of the wrong length.
        assert!(parse_recovery_code("GEZD-GNBV").is_none());
    }
}
