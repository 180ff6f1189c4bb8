//! SQLite-backed update history and code exclusions
//!
//! History is append-only: a batch row is inserted once and never updated.
//! Exclusions are managed here and read by the engine in bulk, once per
//! audit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};
use ts_rs::TS;

use crate::application::{ExclusionStore, HistoryRecorder};
use crate::domain::{BatchKind, StoreId, UpdateBatch};

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("History database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored batch could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Batch {0} is already recorded")]
    Duplicate(uuid::Uuid),
}

pub struct SqliteHistoryRecorder {
    pool: SqlitePool,
}

impl SqliteHistoryRecorder {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, batch: &UpdateBatch) -> Result<(), HistoryError> {
        let (kind, old_code, new_code, store_id) = match &batch.kind {
            BatchKind::Replacement { old_code, new_code } => {
                ("replacement", Some(old_code.as_str()), Some(new_code.as_str()), None)
            }
            BatchKind::Reconciliation { store_id, .. } => {
                ("reconciliation", None, None, Some(store_id.0))
            }
        };
        let batch_json = serde_json::to_string(batch)?;

        let result = sqlx::query(
            r"
            INSERT INTO update_batches
                (batch_id, kind, old_code, new_code, store_id, partial, total_updated, batch_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(batch.batch_id.to_string())
        .bind(kind)
        .bind(old_code)
        .bind(new_code)
        .bind(store_id)
        .bind(batch.partial)
        .bind(i64::try_from(batch.total_updated).unwrap_or(i64::MAX))
        .bind(batch_json)
        .bind(batch.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("Recorded update batch {} ({})", batch.batch_id, kind);
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(HistoryError::Duplicate(batch.batch_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Most recent batches first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<UpdateBatch>, HistoryError> {
        let rows = sqlx::query(
            "SELECT batch_json FROM update_batches ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_batch).collect()
    }

    /// Replacement batches that retired `old_code`.
    pub async fn for_code(&self, old_code: &str) -> Result<Vec<UpdateBatch>, HistoryError> {
        let rows = sqlx::query(
            "SELECT batch_json FROM update_batches WHERE old_code = ? ORDER BY created_at DESC",
        )
        .bind(old_code)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_batch).collect()
    }
}

fn decode_batch(row: &SqliteRow) -> Result<UpdateBatch, HistoryError> {
    let json: String = row.try_get("batch_json")?;
    Ok(serde_json::from_str(&json)?)
}

#[async_trait]
impl HistoryRecorder for SqliteHistoryRecorder {
    async fn record(&self, batch: &UpdateBatch) -> anyhow::Result<()> {
        Ok(self.insert(batch).await?)
    }
}

/// A code the audit must never report for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct Exclusion {
    pub store_id: StoreId,
    pub code: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct SqliteExclusionStore {
    pool: SqlitePool,
}

impl SqliteExclusionStore {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Marks `code` excluded; re-excluding refreshes the reason.
    pub async fn exclude(
        &self,
        store_id: StoreId,
        code: &str,
        reason: Option<&str>,
    ) -> Result<(), HistoryError> {
        sqlx::query(
            r"
            INSERT INTO exclusions (store_id, code, reason, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (store_id, code) DO UPDATE SET reason = excluded.reason
            ",
        )
        .bind(store_id.0)
        .bind(code.trim())
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        info!("Excluded code {} for store {}", code.trim(), store_id);
        Ok(())
    }

    /// Returns whether an exclusion existed.
    pub async fn remove(&self, store_id: StoreId, code: &str) -> Result<bool, HistoryError> {
        let result = sqlx::query("DELETE FROM exclusions WHERE store_id = ? AND code = ?")
            .bind(store_id.0)
            .bind(code.trim())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self, store_id: StoreId) -> Result<Vec<Exclusion>, HistoryError> {
        let rows = sqlx::query(
            "SELECT code, reason, created_at FROM exclusions WHERE store_id = ? ORDER BY code",
        )
        .bind(store_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut exclusions = Vec::with_capacity(rows.len());
        for row in &rows {
            let created_at: String = row.try_get("created_at")?;
            exclusions.push(Exclusion {
                store_id,
                code: row.try_get("code")?,
                reason: row.try_get("reason")?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_default(),
            });
        }
        Ok(exclusions)
    }
}

#[async_trait]
impl ExclusionStore for SqliteExclusionStore {
    async fn excluded_codes(&self, store_id: StoreId) -> anyhow::Result<HashSet<String>> {
        let rows = sqlx::query("SELECT code FROM exclusions WHERE store_id = ?")
            .bind(store_id.0)
            .fetch_all(&self.pool)
            .await?;
        let mut codes = HashSet::with_capacity(rows.len());
        for row in &rows {
            codes.insert(row.try_get::<String, _>("code")?);
        }
        Ok(codes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UpdateOutcome;
    use crate::infrastructure::DatabaseConnection;
    use tempfile::tempdir;

    fn replacement_batch(old: &str) -> UpdateBatch {
        UpdateBatch::new(
            BatchKind::Replacement {
                old_code: old.to_string(),
                new_code: "999".to_string(),
            },
            vec![
                UpdateOutcome::succeeded(StoreId(1), "ERP", 3),
                UpdateOutcome::failed(StoreId(2), "Web", "timeout"),
            ],
            false,
        )
    }

    #[tokio::test]
    async fn recorded_batch_reads_back_identically() {
        let db = DatabaseConnection::in_memory().await.unwrap();
        let history = SqliteHistoryRecorder::new(db.pool().clone());
        let batch = replacement_batch("123");

        history.record(&batch).await.unwrap();

        let recent = history.recent(10).await.unwrap();
        assert_eq!(recent, vec![batch.clone()]);
        assert_eq!(history.for_code("123").await.unwrap().len(), 1);
        assert!(history.for_code("999").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batches_are_write_once() {
        let db = DatabaseConnection::in_memory().await.unwrap();
        let history = SqliteHistoryRecorder::new(db.pool().clone());
        let batch = replacement_batch("123");

        history.insert(&batch).await.unwrap();
        let again = history.insert(&batch).await;
        assert!(matches!(again, Err(HistoryError::Duplicate(id)) if id == batch.batch_id));
    }

    #[tokio::test]
    async fn history_survives_reopen() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("history.db").display());
        let batch = replacement_batch("42");
        {
            let db = DatabaseConnection::new(&url).await.unwrap();
            db.migrate().await.unwrap();
            SqliteHistoryRecorder::new(db.pool().clone())
                .record(&batch)
                .await
                .unwrap();
            db.pool().close().await;
        }
        let db = DatabaseConnection::new(&url).await.unwrap();
        let recent = SqliteHistoryRecorder::new(db.pool().clone())
            .recent(5)
            .await
            .unwrap();
        assert_eq!(recent[0].batch_id, batch.batch_id);
        assert_eq!(recent[0].total_updated, 3);
    }

    #[tokio::test]
    async fn exclusions_are_scoped_per_store() {
        let db = DatabaseConnection::in_memory().await.unwrap();
        let exclusions = SqliteExclusionStore::new(db.pool().clone());

        exclusions.exclude(StoreId(1), "111", Some("kit")).await.unwrap();
        exclusions.exclude(StoreId(1), " 222 ", None).await.unwrap();
        exclusions.exclude(StoreId(2), "333", None).await.unwrap();

        let codes = exclusions.excluded_codes(StoreId(1)).await.unwrap();
        assert_eq!(codes, HashSet::from(["111".to_string(), "222".to_string()]));
        assert!(exclusions.is_excluded(StoreId(2), "333").await.unwrap());
        assert!(!exclusions.is_excluded(StoreId(2), "111").await.unwrap());

        assert!(exclusions.remove(StoreId(1), "111").await.unwrap());
        assert!(!exclusions.remove(StoreId(1), "111").await.unwrap());
        let listed = exclusions.list(StoreId(1)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].code, "222");
    }
}
