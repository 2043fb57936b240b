/// Interaction repository: headers and cipher blobs.
use sqlx::SqlitePool;

use super::db_err;
use super::models::{CipherBlob, InteractionHeader};
use crate::error::Result;

/// Insert a header and all of its blobs in one transaction.
/// On any failure no rows survive.
pub async fn insert_encrypted(
    pool: &SqlitePool,
    header: &InteractionHeader,
    blobs: &[CipherBlob],
) -> Result<()> {
    let mut tx = pool.begin().await.map_err(db_err)?;

    sqlx::query(
        r#"
        INSERT INTO interactions
        (id, user_id, created_at, model, tokens, cost_usd, cipher_key_version,
         request_fingerprint, key_nonce, chunk_count, byte_count, chunk_size, truncated)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&header.id)
    .bind(&header.user_id)
    .bind(header.created_at)
    .bind(&header.model)
    .bind(header.tokens)
    .bind(header.cost_usd)
    .bind(header.cipher_key_version)
    .bind(&header.request_fingerprint)
    .bind(&header.key_nonce)
    .bind(header.chunk_count)
    .bind(header.byte_count)
    .bind(header.chunk_size)
    .bind(header.truncated)
    .execute(&mut *tx)
    .await
    .map_err(db_err)?;

    for blob in blobs {
        sqlx::query(
            r#"
            INSERT INTO cipher_blobs (id, interaction_id, chunk_index, nonce, ciphertext)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&blob.id)
        .bind(&blob.interaction_id)
        .bind(blob.chunk_index)
        .bind(&blob.nonce)
        .bind(&blob.ciphertext)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
    }

    tx.commit().await.map_err(db_err)
}

pub async fn find_header(pool: &SqlitePool, id: &str) -> Result<Option<InteractionHeader>> {
    sqlx::query_as("SELECT * FROM interactions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)
}

/// All blobs of an interaction, ordered by chunk index.
pub async fn list_blobs(pool: &SqlitePool, interaction_id: &str) -> Result<Vec<CipherBlob>> {
    sqlx::query_as("SELECT * FROM cipher_blobs WHERE interaction_id = ? ORDER BY chunk_index ASC")
        .bind(interaction_id)
        .fetch_all(pool)
        .await
        .map_err(db_err)
}

pub async fn list_headers_for_user(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<Vec<InteractionHeader>> {
    sqlx::query_as("SELECT * FROM interactions WHERE user_id = ? ORDER BY created_at ASC")
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(db_err)
}

/// Delete an interaction and its blobs.
pub async fn delete_interaction(pool: &SqlitePool, id: &str) -> Result<()> {
    let mut tx = pool.begin().await.map_err(db_err)?;

    sqlx::query("DELETE FROM cipher_blobs WHERE interaction_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

    sqlx::query("DELETE FROM interactions WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

    tx.commit().await.map_err(db_err)
}
