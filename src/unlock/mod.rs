/// Unlock flows: PIN and WebAuthn.
///
/// A successful unlock derives a key-encryption key from the presented
/// credential, unwraps the user's master key, and caches it with a
/// sliding idle TTL. Failures are opaque: the caller learns `false` and
/// nothing else, whether the user exists or not. Concurrent unlock
/// attempts for one user are serialized.
pub mod cache;
pub mod lockout;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use webauthn_rs::prelude::{
    Passkey, PasskeyAuthentication, PublicKeyCredential, RequestChallengeResponse, Webauthn,
};
use zeroize::Zeroize;

use crate::config::CoreConfig;
use crate::crypto::kdf::{KdfParams, SALT_LEN};
use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{CoreError, Result};
use crate::keys::hierarchy;
use crate::keys::record::{self, FidoMeta, PinMeta};
use crate::store::{self, Database};
use cache::MasterKeyCache;
use lockout::PinFailureTracker;

/// Throwaway salt for the timing-equalization derivation performed when
/// no PIN record exists. Never stored.
const DUMMY_SALT: [u8; SALT_LEN] = *b"coldproxy-dummy!";

pub struct UnlockService {
    db: Database,
    webauthn: Arc<Webauthn>,
    cache: MasterKeyCache,
    lockout: PinFailureTracker,
    kdf: KdfParams,
    user_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UnlockService {
    pub fn new(db: Database, webauthn: Arc<Webauthn>, config: &CoreConfig) -> Self {
        Self {
            db,
            webauthn,
            cache: MasterKeyCache::new(config.mk_cache_capacity, config.mk_cache_ttl),
            lockout: PinFailureTracker::new(
                config.pin_lockout_threshold,
                config.pin_lockout_window,
            ),
            kdf: config.kdf,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt a PIN unlock.
    ///
    /// Returns `Ok(true)` and caches the master key on success,
    /// `Ok(false)` for any credential failure (including an unknown
    /// user), and `AccountLocked` while the lockout window holds.
    pub async fn unlock_with_pin(&self, user_id: &str, pin: &str) -> Result<bool> {
        if self.lockout.is_locked(user_id) {
            return Err(CoreError::AccountLocked);
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let record =
            store::keys::find_by_id(self.db.pool(), &record::mk_pin_id(user_id)).await?;

        let Some(record) = record else {
            // No PIN record: run a derivation over the submitted PIN
            // anyway so the response time does not reveal whether the
            // user is provisioned.
            let _ = self.derive_kek(pin.to_string(), DUMMY_SALT).await;
            return Ok(false);
        };

        let meta: PinMeta = record.meta_as()?;
        let salt = decode_salt(&record.id, &meta.salt)?;

        let kek = self.derive_kek(pin.to_string(), salt).await?;

        match hierarchy::unwrap_key(&record.blob, &record.nonce, &kek) {
            Ok(mk) => {
                self.cache.insert(user_id, mk);
                self.lockout.clear(user_id);
                tracing::info!(%user_id, "PIN unlock succeeded");
                Ok(true)
            }
            Err(CoreError::DecryptFailed) => {
                self.lockout.record_failure(user_id);
                tracing::info!(%user_id, "PIN unlock rejected");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Begin a WebAuthn unlock ceremony: authentication options listing
    /// every credential registered for the user. The returned state must
    /// be kept in the caller's session and handed back to
    /// [`Self::unlock_with_webauthn`].
    pub async fn start_webauthn_unlock(
        &self,
        user_id: &str,
    ) -> Result<(RequestChallengeResponse, PasskeyAuthentication)> {
        let passkeys = self.load_passkeys(user_id).await?;
        if passkeys.is_empty() {
            return Err(CoreError::NotFound(format!(
                "no webauthn credentials for user {user_id}"
            )));
        }

        self.webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|e| CoreError::WebAuthn(e.to_string()))
    }

    /// Finish a WebAuthn unlock: verify the assertion, persist the new
    /// signature counter, derive the ceremony KEK, and try to unwrap
    /// the user's master key.
    pub async fn unlock_with_webauthn(
        &self,
        user_id: &str,
        assertion: &PublicKeyCredential,
        state: &PasskeyAuthentication,
    ) -> Result<bool> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let auth = match self.webauthn.finish_passkey_authentication(assertion, state) {
            Ok(auth) => auth,
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "webauthn assertion rejected");
                return Ok(false);
            }
        };

        if !auth.user_verified() {
            tracing::warn!(%user_id, "webauthn assertion without user verification");
            return Ok(false);
        }

        let cred_b64 = URL_SAFE_NO_PAD.encode(&assertion.raw_id);
        let record_id = record::fido2_credential_id(user_id, &cred_b64);
        let Some(cred_record) = store::keys::find_by_id(self.db.pool(), &record_id).await? else {
            return Ok(false);
        };

        let mut meta: FidoMeta = cred_record.meta_as()?;

        // The signature counter must strictly increase, unless the
        // authenticator does not implement one (both sides zero).
        let new_counter = auth.counter();
        let counters_in_use = new_counter != 0 || meta.counter != 0;
        if counters_in_use && new_counter <= meta.counter {
            tracing::warn!(
                %user_id,
                stored = meta.counter,
                presented = new_counter,
                "webauthn counter regression, possible cloned authenticator"
            );
            return Ok(false);
        }

        let mut passkey = decode_passkey(&record_id, &meta)?;
        passkey.update_credential(&auth);
        meta.counter = new_counter;
        meta.credential_public_key = encode_passkey(&passkey)?;
        let meta_value = serde_json::to_value(&meta)
            .map_err(|e| CoreError::Storage(format!("fido meta: {e}")))?;
        store::keys::update_meta(self.db.pool(), &record_id, &meta_value).await?;

        let salt = decode_salt(&record_id, &meta.salt)?;
        let kek = hierarchy::derive_kek_from_webauthn(
            assertion.response.client_data_json.as_ref(),
            assertion.raw_id.as_ref(),
            assertion.response.signature.as_ref(),
            &salt,
        )?;

        let Some(mk_record) =
            store::keys::find_by_id(self.db.pool(), &record::mk_fido_id(user_id)).await?
        else {
            return Ok(false);
        };

        match hierarchy::unwrap_key(&mk_record.blob, &mk_record.nonce, &kek) {
            Ok(mk) => {
                self.cache.insert(user_id, mk);
                tracing::info!(%user_id, "webauthn unlock succeeded");
                Ok(true)
            }
            Err(CoreError::DecryptFailed) => {
                tracing::info!(%user_id, "webauthn unlock could not unwrap master key");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Return the user's DEK iff their master key is cached. The DEK is
    /// unwrapped fresh on every call; only the MK is cached.
    pub async fn get_decrypted_dek(&self, user_id: &str) -> Option<SensitiveBytes32> {
        let mk = self.cache.get(user_id)?;
        let record = store::keys::find_by_id(self.db.pool(), &record::dek_id(user_id))
            .await
            .ok()
            .flatten()?;
        hierarchy::unwrap_key(&record.blob, &record.nonce, &mk).ok()
    }

    /// Evict and zeroize the user's cached master key.
    pub fn logout(&self, user_id: &str) {
        self.cache.remove(user_id);
        tracing::info!(%user_id, "master key evicted");
    }

    /// Read the cached master key without refreshing provisioning state.
    pub fn cached_master_key(&self, user_id: &str) -> Option<SensitiveBytes32> {
        self.cache.get(user_id)
    }

    /// Cache a master key directly (used by setup and recovery flows).
    pub(crate) fn cache_master_key(&self, user_id: &str, mk: SensitiveBytes32) {
        self.cache.insert(user_id, mk);
    }

    async fn load_passkeys(&self, user_id: &str) -> Result<Vec<Passkey>> {
        let records = store::keys::find_by_type(
            self.db.pool(),
            record::KeyRecordType::Fido2Credential,
        )
        .await?;

        let prefix = record::fido2_prefix(user_id);
        records
            .iter()
            .filter(|r| r.id.starts_with(&prefix))
            .map(|r| {
                let meta: FidoMeta = r.meta_as()?;
                decode_passkey(&r.id, &meta)
            })
            .collect()
    }

    /// Argon2id runs on the blocking pool; it is far too heavy for an
    /// async worker thread.
    async fn derive_kek(&self, pin: String, salt: [u8; SALT_LEN]) -> Result<SensitiveBytes32> {
        let params = self.kdf;
        tokio::task::spawn_blocking(move || {
            let mut pin = pin;
            let kek = hierarchy::derive_kek_from_pin(&pin, &salt, &params);
            pin.zeroize();
            kek
        })
        .await
        .map_err(|e| CoreError::KeyDerivation(e.to_string()))?
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .user_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn decode_salt(record_id: &str, salt_hex: &str) -> Result<[u8; SALT_LEN]> {
    let bytes = hex::decode(salt_hex)
        .map_err(|e| CoreError::Storage(format!("bad salt on record {record_id}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| CoreError::Storage(format!("bad salt length on record {record_id}")))
}

fn decode_passkey(record_id: &str, meta: &FidoMeta) -> Result<Passkey> {
    let bytes = STANDARD
        .decode(&meta.credential_public_key)
        .map_err(|e| CoreError::Storage(format!("bad credential on record {record_id}: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| CoreError::Storage(format!("bad credential on record {record_id}: {e}")))
}

pub(crate) fn encode_passkey(passkey: &Passkey) -> Result<String> {
    let bytes = serde_json::to_vec(passkey)
        .map_err(|e| CoreError::Storage(format!("credential encode: {e}")))?;
    Ok(STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use webauthn_rs::prelude::Url;
    use webauthn_rs::WebauthnBuilder;

    use super::*;
    use crate::crypto::aead::generate_key;
    use crate::crypto::kdf;
    use crate::keys::record::{KeyRecordType, WrappedKeyRecord};

    fn test_config() -> CoreConfig {
        CoreConfig {
            kdf: KdfParams::fast_insecure(),
            pin_lockout_window: Duration::from_millis(200),
            ..CoreConfig::default()
        }
    }

    fn test_webauthn() -> Arc<Webauthn> {
        let origin = Url::parse("http://localhost:8787").unwrap();
        Arc::new(
            WebauthnBuilder::new("localhost", &origin)
                .unwrap()
                .rp_name("coldproxy test")
                .build()
                .unwrap(),
        )
    }

    /// Provision a PIN-wrapped master key and a DEK directly through the
    /// key store, bypassing the setup service.
    async fn provision(db: &Database, user_id: &str, pin: &str) -> SensitiveBytes32 {
        let mk = generate_key();
        let dek = generate_key();

        let (dek_blob, dek_nonce) = hierarchy::wrap_key(&dek, &mk).unwrap();
        store::keys::create(
            db.pool(),
            &WrappedKeyRecord {
                id: record::dek_id(user_id),
                record_type: KeyRecordType::DataEncryptionKey,
                blob: dek_blob,
                nonce: dek_nonce.to_vec(),
                meta: Some(serde_json::json!({"version": 1})),
            },
        )
        .await
        .unwrap();

        let salt = kdf::generate_salt();
        let kek =
            hierarchy::derive_kek_from_pin(pin, &salt, &KdfParams::fast_insecure()).unwrap();
        let (mk_blob, mk_nonce) = hierarchy::wrap_key(&mk, &kek).unwrap();
        store::keys::create(
            db.pool(),
            &WrappedKeyRecord {
                id: record::mk_pin_id(user_id),
                record_type: KeyRecordType::MasterKeyPin,
                blob: mk_blob,
                nonce: mk_nonce.to_vec(),
                meta: Some(serde_json::json!({"salt": hex::encode(salt)})),
            },
        )
        .await
        .unwrap();

        dek
    }

    #[tokio::test]
    async fn pin_unlock_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        let dek = provision(&db, "u1", "1234").await;
        let unlock = UnlockService::new(db, test_webauthn(), &test_config());

        assert!(unlock.get_decrypted_dek("u1").await.is_none());

        assert!(unlock.unlock_with_pin("u1", "1234").await.unwrap());

        let got = unlock.get_decrypted_dek("u1").await.unwrap();
        assert_eq!(got.as_bytes(), dek.as_bytes());
    }

    #[tokio::test]
    async fn wrong_pin_is_opaque_false() {
        let db = Database::in_memory().await.unwrap();
        provision(&db, "u1", "1234").await;
        let unlock = UnlockService::new(db, test_webauthn(), &test_config());

        assert!(!unlock.unlock_with_pin("u1", "0000").await.unwrap());
        assert!(unlock.get_decrypted_dek("u1").await.is_none());
    }

    #[tokio::test]
    async fn unknown_user_is_opaque_false() {
        let db = Database::in_memory().await.unwrap();
        let unlock = UnlockService::new(db, test_webauthn(), &test_config());

        assert!(!unlock.unlock_with_pin("ghost", "1234").await.unwrap());
    }

    #[tokio::test]
    async fn lockout_after_threshold_even_for_correct_pin() {
        let db = Database::in_memory().await.unwrap();
        provision(&db, "u1", "1234").await;
        let unlock = UnlockService::new(db, test_webauthn(), &test_config());

        for _ in 0..5 {
            assert!(!unlock.unlock_with_pin("u1", "0000").await.unwrap());
        }

        let err = unlock.unlock_with_pin("u1", "1234").await.unwrap_err();
        assert!(matches!(err, CoreError::AccountLocked));
    }

    #[tokio::test]
    async fn lockout_clears_after_window_and_success() {
        let db = Database::in_memory().await.unwrap();
        provision(&db, "u1", "1234").await;
        let unlock = UnlockService::new(db, test_webauthn(), &test_config());

        for _ in 0..5 {
            let _ = unlock.unlock_with_pin("u1", "0000").await.unwrap();
        }
        assert!(matches!(
            unlock.unlock_with_pin("u1", "1234").await,
            Err(CoreError::AccountLocked)
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(unlock.unlock_with_pin("u1", "1234").await.unwrap());
        // Counter cleared: a single failure does not re-lock.
        assert!(!unlock.unlock_with_pin("u1", "0000").await.unwrap());
        assert!(unlock.unlock_with_pin("u1", "1234").await.unwrap());
    }

    #[tokio::test]
    async fn logout_evicts_master_key() {
        let db = Database::in_memory().await.unwrap();
        provision(&db, "u1", "1234").await;
        let unlock = UnlockService::new(db, test_webauthn(), &test_config());

        assert!(unlock.unlock_with_pin("u1", "1234").await.unwrap());
        assert!(unlock.get_decrypted_dek("u1").await.is_some());

        unlock.logout("u1");
        assert!(unlock.get_decrypted_dek("u1").await.is_none());
    }

    #[tokio::test]
    async fn webauthn_challenge_requires_credentials() {
        let db = Database::in_memory().await.unwrap();
        provision(&db, "u1", "1234").await;
        let unlock = UnlockService::new(db, test_webauthn(), &test_config());

        let err = unlock.start_webauthn_unlock("u1").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
