use async_trait::async_trait;
use chrono::Utc;
use exam_core::model::AttemptId;
use sqlx::Row;

use super::SqliteRepository;
use crate::repository::{KeyValueStore, Namespace, StorageError, StoreKey};

fn conn<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

#[async_trait]
impl KeyValueStore for SqliteRepository {
    async fn get(&self, key: &StoreKey) -> Result<Option<String>, StorageError> {
        let row = sqlx::query(
            r"
                SELECT value
                FROM kv_entries
                WHERE namespace = ?1 AND entry_key = ?2
            ",
        )
        .bind(key.namespace.as_str())
        .bind(key.attempt_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?;

        row.map(|row| row.try_get::<String, _>("value").map_err(ser))
            .transpose()
    }

    async fn put(&self, key: &StoreKey, value: String) -> Result<(), StorageError> {
        sqlx::query(
            r"
                INSERT INTO kv_entries (namespace, entry_key, value, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(namespace, entry_key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
            ",
        )
        .bind(key.namespace.as_str())
        .bind(key.attempt_id.to_string())
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        Ok(())
    }

    async fn remove(&self, key: &StoreKey) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_entries WHERE namespace = ?1 AND entry_key = ?2")
            .bind(key.namespace.as_str())
            .bind(key.attempt_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(conn)?;
        Ok(())
    }

    async fn keys(&self, namespace: Namespace) -> Result<Vec<AttemptId>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT entry_key
                FROM kv_entries
                WHERE namespace = ?1
                ORDER BY entry_key ASC
            ",
        )
        .bind(namespace.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("entry_key").map_err(ser)?;
            out.push(raw.parse::<AttemptId>().map_err(ser)?);
        }
        Ok(out)
    }
}
