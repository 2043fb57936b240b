/// Key-store repository: wrapped-key rows.
///
/// All queries use sqlx runtime-checked queries so no live database is
/// needed at build time.
use serde_json::Value;
use sqlx::SqlitePool;

use super::db_err;
use crate::error::{CoreError, Result};
use crate::keys::record::{KeyRecordType, WrappedKeyRecord};

type KeyRow = (String, String, Vec<u8>, String, Option<String>);

fn row_to_record(row: KeyRow) -> Result<WrappedKeyRecord> {
    let (id, type_str, blob, nonce_hex, meta_text) = row;

    let record_type = KeyRecordType::parse(&type_str)
        .ok_or_else(|| CoreError::Storage(format!("unknown key record type {type_str} for {id}")))?;

    let nonce = hex::decode(&nonce_hex)
        .map_err(|e| CoreError::Storage(format!("bad nonce on record {id}: {e}")))?;

    let meta = meta_text
        .map(|text| {
            serde_json::from_str::<Value>(&text)
                .map_err(|e| CoreError::Storage(format!("bad meta on record {id}: {e}")))
        })
        .transpose()?;

    Ok(WrappedKeyRecord {
        id,
        record_type,
        blob,
        nonce,
        meta,
    })
}

pub async fn create(pool: &SqlitePool, record: &WrappedKeyRecord) -> Result<()> {
    let meta_text = record.meta.as_ref().map(Value::to_string);

    let result = sqlx::query(
        "INSERT INTO key_records (id, type, blob, nonce, meta) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(record.record_type.as_str())
    .bind(&record.blob)
    .bind(hex::encode(&record.nonce))
    .bind(meta_text)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(CoreError::Conflict(record.id.clone()))
        }
        Err(e) => Err(db_err(e)),
    }
}

pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<WrappedKeyRecord>> {
    let row: Option<KeyRow> =
        sqlx::query_as("SELECT id, type, blob, nonce, meta FROM key_records WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(db_err)?;

    row.map(row_to_record).transpose()
}

pub async fn find_by_type(
    pool: &SqlitePool,
    record_type: KeyRecordType,
) -> Result<Vec<WrappedKeyRecord>> {
    let rows: Vec<KeyRow> =
        sqlx::query_as("SELECT id, type, blob, nonce, meta FROM key_records WHERE type = ?")
            .bind(record_type.as_str())
            .fetch_all(pool)
            .await
            .map_err(db_err)?;

    rows.into_iter().map(row_to_record).collect()
}

/// Update a record's blob and nonce. A `None` meta leaves the stored
/// meta untouched.
pub async fn update(
    pool: &SqlitePool,
    id: &str,
    blob: &[u8],
    nonce: &[u8],
    meta: Option<&Value>,
) -> Result<()> {
    let meta_text = meta.map(Value::to_string);

    let result = sqlx::query(
        "UPDATE key_records SET blob = ?, nonce = ?, meta = COALESCE(?, meta) WHERE id = ?",
    )
    .bind(blob)
    .bind(hex::encode(nonce))
    .bind(meta_text)
    .bind(id)
    .execute(pool)
    .await
    .map_err(db_err)?;

    if result.rows_affected() == 0 {
        return Err(CoreError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Update only the meta document of a record.
pub async fn update_meta(pool: &SqlitePool, id: &str, meta: &Value) -> Result<()> {
    let result = sqlx::query("UPDATE key_records SET meta = ? WHERE id = ?")
        .bind(meta.to_string())
        .bind(id)
        .execute(pool)
        .await
        .map_err(db_err)?;

    if result.rows_affected() == 0 {
        return Err(CoreError::NotFound(id.to_string()));
    }
    Ok(())
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM key_records WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// True if any wrapped master key exists at all.
pub async fn has_master_key(pool: &SqlitePool) -> Result<bool> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM key_records WHERE type IN ('master_key_pin', 'master_key_fido')",
    )
    .fetch_one(pool)
    .await
    .map_err(db_err)?;

    Ok(count > 0)
}

/// One mutation inside an atomic batch.
#[derive(Debug)]
pub enum KeyWriteOp {
    /// Insert; fails the batch with `Conflict` if the id exists.
    Insert(WrappedKeyRecord),
    /// Insert or fully replace.
    Upsert(WrappedKeyRecord),
    /// Replace blob, nonce, and (when given) meta of an existing record.
    Update {
        id: String,
        blob: Vec<u8>,
        nonce: Vec<u8>,
        meta: Option<Value>,
    },
    /// Delete if present.
    Delete(String),
}

/// Apply a set of key-store mutations in one transaction: all or none.
/// Used by rotation and multi-record provisioning.
pub async fn apply_atomic(pool: &SqlitePool, ops: Vec<KeyWriteOp>) -> Result<()> {
    let mut tx = pool.begin().await.map_err(db_err)?;

    for op in ops {
        match op {
            KeyWriteOp::Insert(record) => {
                let meta_text = record.meta.as_ref().map(Value::to_string);
                let result = sqlx::query(
                    "INSERT INTO key_records (id, type, blob, nonce, meta) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&record.id)
                .bind(record.record_type.as_str())
                .bind(&record.blob)
                .bind(hex::encode(&record.nonce))
                .bind(meta_text)
                .execute(&mut *tx)
                .await;

                match result {
                    Ok(_) => {}
                    Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                        return Err(CoreError::Conflict(record.id));
                    }
                    Err(e) => return Err(db_err(e)),
                }
            }
            KeyWriteOp::Upsert(record) => {
                let meta_text = record.meta.as_ref().map(Value::to_string);
                sqlx::query(
                    r#"
                    INSERT INTO key_records (id, type, blob, nonce, meta)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT (id) DO UPDATE
                    SET type = excluded.type, blob = excluded.blob,
                        nonce = excluded.nonce, meta = excluded.meta
                    "#,
                )
                .bind(&record.id)
                .bind(record.record_type.as_str())
                .bind(&record.blob)
                .bind(hex::encode(&record.nonce))
                .bind(meta_text)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            KeyWriteOp::Update {
                id,
                blob,
                nonce,
                meta,
            } => {
                let meta_text = meta.as_ref().map(Value::to_string);
                let result = sqlx::query(
                    "UPDATE key_records SET blob = ?, nonce = ?, meta = COALESCE(?, meta) WHERE id = ?",
                )
                .bind(&blob)
                .bind(hex::encode(&nonce))
                .bind(meta_text)
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                if result.rows_affected() == 0 {
                    return Err(CoreError::NotFound(id));
                }
            }
            KeyWriteOp::Delete(id) => {
                sqlx::query("DELETE FROM key_records WHERE id = ?")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
        }
    }

    tx.commit().await.map_err(db_err)
}
