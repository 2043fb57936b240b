/// Chunked AEAD encryption of interaction bodies.
///
/// Each interaction gets its own key derived from the user's DEK and a
/// fresh 24-byte nonce stored on the header. The body is split into
/// fixed-size chunks; every chunk is sealed with a fresh nonce and an
/// AAD binding it to (user, interaction, position, key version), so
/// blobs cannot be reordered, dropped, or replayed across interactions.
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::crypto::aead::{self, NONCE_LEN};
use crate::error::{CoreError, Result};
use crate::keys::hierarchy;
use crate::keys::record::{self, DekMeta};
use crate::store::models::{CipherBlob, InteractionHeader};
use crate::store::{self, Database};
use crate::unlock::UnlockService;

/// A plaintext interaction as produced by the capture layer.
#[derive(Debug, Clone)]
pub struct PlainInteraction {
    pub user_id: String,
    pub model: Option<String>,
    pub tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub body: Vec<u8>,
    pub request_fingerprint: Option<String>,
    /// True when the capture layer bounded the body length.
    pub truncated: bool,
}

pub struct InteractionEncryptor {
    db: Database,
    unlock: Arc<UnlockService>,
    chunk_size: usize,
}

impl InteractionEncryptor {
    pub fn new(db: Database, unlock: Arc<UnlockService>, config: &CoreConfig) -> Self {
        Self {
            db,
            unlock,
            chunk_size: config.chunk_size,
        }
    }

    /// Encrypt and persist an interaction. Header and blobs commit in
    /// one transaction; on any failure nothing survives. Returns the
    /// new interaction id, or `Locked` when the user's master key is
    /// not cached.
    pub async fn encrypt_interaction(&self, interaction: &PlainInteraction) -> Result<String> {
        let user_id = &interaction.user_id;
        let dek = self
            .unlock
            .get_decrypted_dek(user_id)
            .await
            .ok_or(CoreError::Locked)?;

        let dek_record = store::keys::find_by_id(self.db.pool(), &record::dek_id(user_id))
            .await?
            .ok_or_else(|| CoreError::NotFound(record::dek_id(user_id)))?;
        let key_version = dek_record.meta_as::<DekMeta>()?.version;

        let interaction_id = Uuid::now_v7().to_string();
        let key_nonce = aead::generate_nonce();
        let ik = hierarchy::derive_interaction_key(&dek, &key_nonce);

        let body = &interaction.body;
        let mut blobs = Vec::new();
        // An empty body still gets one (empty) sealed chunk so every
        // interaction has at least one authenticated blob.
        let chunks: Vec<&[u8]> = if body.is_empty() {
            vec![&[][..]]
        } else {
            body.chunks(self.chunk_size).collect()
        };

        for (index, chunk) in chunks.iter().enumerate() {
            let aad = chunk_aad(user_id, &interaction_id, index as u32, key_version);
            let (nonce, ciphertext) = aead::encrypt(&ik, chunk, &aad)?;
            blobs.push(CipherBlob {
                id: Uuid::now_v7().to_string(),
                interaction_id: interaction_id.clone(),
                chunk_index: index as i64,
                nonce: hex::encode(nonce),
                ciphertext,
            });
        }

        let header = InteractionHeader {
            id: interaction_id.clone(),
            user_id: user_id.clone(),
            created_at: Utc::now(),
            model: interaction.model.clone(),
            tokens: interaction.tokens,
            cost_usd: interaction.cost_usd,
            cipher_key_version: key_version as i64,
            request_fingerprint: interaction.request_fingerprint.clone(),
            key_nonce: hex::encode(key_nonce),
            chunk_count: blobs.len() as i64,
            byte_count: body.len() as i64,
            chunk_size: self.chunk_size as i64,
            truncated: interaction.truncated,
        };

        store::interactions::insert_encrypted(self.db.pool(), &header, &blobs).await?;

        tracing::debug!(
            %interaction_id,
            %user_id,
            chunks = header.chunk_count,
            bytes = header.byte_count,
            "interaction sealed"
        );
        Ok(interaction_id)
    }

    /// Decrypt a stored interaction for its owner.
    ///
    /// Returns `NotFound` for a missing id or a caller that does not
    /// own the interaction (no distinction), `Locked` without a cached
    /// master key, and `Tampered` when the stored rows no longer
    /// authenticate.
    pub async fn read_interaction(&self, interaction_id: &str, user_id: &str) -> Result<Vec<u8>> {
        let header = store::interactions::find_header(self.db.pool(), interaction_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(interaction_id.to_string()))?;

        if header.user_id != user_id {
            return Err(CoreError::NotFound(interaction_id.to_string()));
        }

        let dek = self
            .unlock
            .get_decrypted_dek(user_id)
            .await
            .ok_or(CoreError::Locked)?;

        self.decrypt_with_dek(&header, &dek).await
    }

    /// Decrypt every interaction owned by the user, oldest first.
    pub async fn export_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<(InteractionHeader, Vec<u8>)>> {
        let dek = self
            .unlock
            .get_decrypted_dek(user_id)
            .await
            .ok_or(CoreError::Locked)?;

        let headers =
            store::interactions::list_headers_for_user(self.db.pool(), user_id).await?;

        let mut out = Vec::with_capacity(headers.len());
        for header in headers {
            let body = self.decrypt_with_dek(&header, &dek).await?;
            out.push((header, body));
        }
        Ok(out)
    }

    async fn decrypt_with_dek(
        &self,
        header: &InteractionHeader,
        dek: &crate::crypto::sensitive::SensitiveBytes32,
    ) -> Result<Vec<u8>> {
        let key_nonce: [u8; NONCE_LEN] = hex::decode(&header.key_nonce)
            .map_err(|_| CoreError::Tampered("key nonce".into()))?
            .try_into()
            .map_err(|_| CoreError::Tampered("key nonce".into()))?;
        let ik = hierarchy::derive_interaction_key(dek, &key_nonce);

        let blobs = store::interactions::list_blobs(self.db.pool(), &header.id).await?;
        if blobs.len() as i64 != header.chunk_count {
            return Err(CoreError::Tampered(format!(
                "expected {} chunks, found {}",
                header.chunk_count,
                blobs.len()
            )));
        }

        let mut plaintext = Vec::with_capacity(header.byte_count as usize);
        for (index, blob) in blobs.iter().enumerate() {
            if blob.chunk_index != index as i64 {
                return Err(CoreError::Tampered(format!(
                    "chunk index gap at position {index}"
                )));
            }

            let nonce: [u8; NONCE_LEN] = hex::decode(&blob.nonce)
                .map_err(|_| CoreError::Tampered(format!("chunk {index} nonce")))?
                .try_into()
                .map_err(|_| CoreError::Tampered(format!("chunk {index} nonce")))?;

            let aad = chunk_aad(
                &header.user_id,
                &header.id,
                index as u32,
                header.cipher_key_version as u32,
            );
            let chunk = aead::decrypt(&ik, &nonce, &blob.ciphertext, &aad)
                .map_err(|_| CoreError::Tampered(format!("chunk {index}")))?;
            plaintext.extend_from_slice(&chunk);
        }

        Ok(plaintext)
    }
}

/// AAD binding a chunk to its owner, interaction, position, and key
/// version: user_id || interaction_id || index (u32 BE) || version (u32 BE).
fn chunk_aad(user_id: &str, interaction_id: &str, index: u32, key_version: u32) -> Vec<u8> {
    let mut aad =
        Vec::with_capacity(user_id.len() + interaction_id.len() + 8);
    aad.extend_from_slice(user_id.as_bytes());
    aad.extend_from_slice(interaction_id.as_bytes());
    aad.extend_from_slice(&index.to_be_bytes());
    aad.extend_from_slice(&key_version.to_be_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aad_is_deterministic() {
        assert_eq!(chunk_aad("u1", "i1", 0, 1), chunk_aad("u1", "i1", 0, 1));
    }

    #[test]
    fn aad_separates_every_component() {
        let base = chunk_aad("u1", "i1", 0, 1);
        assert_ne!(base, chunk_aad("u2", "i1", 0, 1));
        assert_ne!(base, chunk_aad("u1", "i2", 0, 1));
        assert_ne!(base, chunk_aad("u1", "i1", 1, 1));
        assert_ne!(base, chunk_aad("u1", "i1", 0, 2));
    }

    #[test]
    fn aad_index_is_big_endian() {
        let aad = chunk_aad("", "", 1, 0);
        assert_eq!(&aad[..4], &[0, 0, 0, 1]);
    }
}
