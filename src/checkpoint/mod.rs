//! Durable per-file, per-stage progress.
//!
//! The [`CheckpointStore`] is the hand-off contract between stages and the
//! only state that survives a restart. Keys are `(period, stage,
//! logical_name)`; statuses move `pending → in_progress → done | failed`.
//!
//! Two rules make resume safe:
//! - forward writes never touch a row that is already `done`; only the
//!   explicit [`CheckpointStore::reset`] family can change it
//! - writes to the same key are serialized in-process by a per-key lock, and
//!   each write is a single guarded `UPSERT`
//!
//! # Example
//!
//! ```ignore
//! let store = CheckpointStore::new(Database::new_in_memory().await?);
//! let key = CheckpointKey::new("2025-08", Stage::Download, "Empresas0.zip");
//! store.mark_in_progress(&key).await?;
//! store.mark_done(&key, None).await?;
//! assert!(store.is_done(&key).await?);
//! ```

mod error;
mod record;

pub use error::{CheckpointDbErrorKind, CheckpointError};
pub use record::{CheckpointKey, CheckpointRecord, CheckpointStatus, Stage};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use crate::db::Database;
use record::CheckpointRow;

/// Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// SQLite-backed checkpoint store. Cheap to clone; clones share locks.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    db: Database,
    locks: Arc<DashMap<CheckpointKey, Arc<Mutex<()>>>>,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: Arc::new(DashMap::new()),
        }
    }

    async fn lock_key(&self, key: &CheckpointKey) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Reads one checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Database`] if the query fails.
    pub async fn get(&self, key: &CheckpointKey) -> Result<Option<CheckpointRecord>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r"SELECT period, stage, logical_name, status, detail, updated_at
              FROM checkpoints
              WHERE period = ? AND stage = ? AND logical_name = ?",
        )
        .bind(&key.period)
        .bind(key.stage.as_str())
        .bind(&key.logical_name)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(CheckpointRecord::try_from).transpose()
    }

    /// Status of a key; absent keys are `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Database`] if the query fails.
    pub async fn status(&self, key: &CheckpointKey) -> Result<CheckpointStatus> {
        Ok(self
            .get(key)
            .await?
            .map_or(CheckpointStatus::Pending, |record| record.status))
    }

    /// True when the key is `done`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Database`] if the query fails.
    pub async fn is_done(&self, key: &CheckpointKey) -> Result<bool> {
        Ok(self.status(key).await? == CheckpointStatus::Done)
    }

    /// Marks a key `in_progress`. Returns `false` when the key was already
    /// `done` and therefore left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Database`] if the write fails.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn mark_in_progress(&self, key: &CheckpointKey) -> Result<bool> {
        self.advance(key, CheckpointStatus::InProgress, None).await
    }

    /// Marks a key `done`, storing optional stage output in `detail`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Database`] if the write fails.
    #[instrument(skip(self, detail), fields(key = %key))]
    pub async fn mark_done(&self, key: &CheckpointKey, detail: Option<&str>) -> Result<bool> {
        self.advance(key, CheckpointStatus::Done, detail).await
    }

    /// Marks a key `failed` with a reason.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Database`] if the write fails.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn mark_failed(&self, key: &CheckpointKey, reason: &str) -> Result<bool> {
        self.advance(key, CheckpointStatus::Failed, Some(reason))
            .await
    }

    async fn advance(
        &self,
        key: &CheckpointKey,
        status: CheckpointStatus,
        detail: Option<&str>,
    ) -> Result<bool> {
        let _guard = self.lock_key(key).await;
        let result = sqlx::query(
            r"INSERT INTO checkpoints (period, stage, logical_name, status, detail, updated_at)
              VALUES (?, ?, ?, ?, ?, datetime('now'))
              ON CONFLICT (period, stage, logical_name) DO UPDATE
              SET status = excluded.status,
                  detail = excluded.detail,
                  updated_at = excluded.updated_at
              WHERE checkpoints.status != 'done'",
        )
        .bind(&key.period)
        .bind(key.stage.as_str())
        .bind(&key.logical_name)
        .bind(status.as_str())
        .bind(detail)
        .execute(self.db.pool())
        .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            debug!(%status, "checkpoint already done, write ignored");
        }
        Ok(applied)
    }

    /// Explicitly overwrites a key, including a `done` one.
    ///
    /// Used for demotions (a downloaded file that failed validation) and for
    /// operator resets.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Database`] if the write fails.
    #[instrument(skip(self, detail), fields(key = %key))]
    pub async fn reset(
        &self,
        key: &CheckpointKey,
        status: CheckpointStatus,
        detail: Option<&str>,
    ) -> Result<()> {
        let _guard = self.lock_key(key).await;
        sqlx::query(
            r"INSERT INTO checkpoints (period, stage, logical_name, status, detail, updated_at)
              VALUES (?, ?, ?, ?, ?, datetime('now'))
              ON CONFLICT (period, stage, logical_name) DO UPDATE
              SET status = excluded.status,
                  detail = excluded.detail,
                  updated_at = excluded.updated_at",
        )
        .bind(&key.period)
        .bind(key.stage.as_str())
        .bind(&key.logical_name)
        .bind(status.as_str())
        .bind(detail)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Deletes every checkpoint of a period, optionally limited to one stage.
    /// Returns the number of removed rows.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn reset_period(&self, period: &str, stage: Option<Stage>) -> Result<u64> {
        let result = match stage {
            Some(stage) => {
                sqlx::query("DELETE FROM checkpoints WHERE period = ? AND stage = ?")
                    .bind(period)
                    .bind(stage.as_str())
                    .execute(self.db.pool())
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM checkpoints WHERE period = ?")
                    .bind(period)
                    .execute(self.db.pool())
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Lists the checkpoints of a period, optionally for one stage, ordered by
    /// stage then name.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Database`] if the query fails.
    pub async fn list(&self, period: &str, stage: Option<Stage>) -> Result<Vec<CheckpointRecord>> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            r"SELECT period, stage, logical_name, status, detail, updated_at
              FROM checkpoints
              WHERE period = ? AND (? IS NULL OR stage = ?)
              ORDER BY CASE stage
                  WHEN 'download' THEN 0
                  WHEN 'validate' THEN 1
                  WHEN 'extract' THEN 2
                  WHEN 'load_entry' THEN 3
                  ELSE 4 END,
                logical_name",
        )
        .bind(period)
        .bind(stage.map(|s| s.as_str()))
        .bind(stage.map(|s| s.as_str()))
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(CheckpointRecord::try_from).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn store() -> CheckpointStore {
        CheckpointStore::new(Database::new_in_memory().await.unwrap())
    }

    fn key(name: &str) -> CheckpointKey {
        CheckpointKey::new("2025-08", Stage::Download, name)
    }

    #[tokio::test]
    async fn test_absent_key_is_pending() {
        let store = store().await;
        assert_eq!(
            store.status(&key("Empresas0.zip")).await.unwrap(),
            CheckpointStatus::Pending
        );
        assert!(store.get(&key("Empresas0.zip")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_forward_transitions_are_recorded() {
        let store = store().await;
        let k = key("Empresas0.zip");

        assert!(store.mark_in_progress(&k).await.unwrap());
        assert_eq!(store.status(&k).await.unwrap(), CheckpointStatus::InProgress);

        assert!(store.mark_done(&k, Some("ok")).await.unwrap());
        let record = store.get(&k).await.unwrap().unwrap();
        assert_eq!(record.status, CheckpointStatus::Done);
        assert_eq!(record.detail.as_deref(), Some("ok"));
        assert!(!record.updated_at.is_empty());
    }

    #[tokio::test]
    async fn test_done_is_never_reentered_without_reset() {
        let store = store().await;
        let k = key("Socios0.zip");
        store.mark_done(&k, None).await.unwrap();

        assert!(!store.mark_in_progress(&k).await.unwrap());
        assert!(!store.mark_failed(&k, "late failure").await.unwrap());
        assert!(store.is_done(&k).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_overrides_done() {
        let store = store().await;
        let k = key("Simples.zip");
        store.mark_done(&k, None).await.unwrap();

        store
            .reset(&k, CheckpointStatus::Failed, Some("crc mismatch"))
            .await
            .unwrap();

        let record = store.get(&k).await.unwrap().unwrap();
        assert_eq!(record.status, CheckpointStatus::Failed);
        assert_eq!(record.detail.as_deref(), Some("crc mismatch"));
    }

    #[tokio::test]
    async fn test_failed_key_can_be_retried() {
        let store = store().await;
        let k = key("Cnaes.zip");
        store.mark_failed(&k, "timeout").await.unwrap();
        assert!(store.mark_in_progress(&k).await.unwrap());
        assert!(store.mark_done(&k, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_filters_by_stage_and_orders() {
        let store = store().await;
        store.mark_done(&key("b.zip"), None).await.unwrap();
        store.mark_done(&key("a.zip"), None).await.unwrap();
        store
            .mark_done(&CheckpointKey::new("2025-08", Stage::Load, "empresa"), None)
            .await
            .unwrap();
        store
            .mark_done(&CheckpointKey::new("2025-07", Stage::Download, "a.zip"), None)
            .await
            .unwrap();

        let downloads = store.list("2025-08", Some(Stage::Download)).await.unwrap();
        let names: Vec<_> = downloads.iter().map(|r| r.key.logical_name.as_str()).collect();
        assert_eq!(names, ["a.zip", "b.zip"]);

        let all = store.list("2025-08", None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].key.stage, Stage::Load);
    }

    #[tokio::test]
    async fn test_reset_period_removes_only_that_period() {
        let store = store().await;
        store.mark_done(&key("a.zip"), None).await.unwrap();
        store
            .mark_done(&CheckpointKey::new("2025-07", Stage::Download, "a.zip"), None)
            .await
            .unwrap();

        assert_eq!(store.reset_period("2025-08", None).await.unwrap(), 1);
        assert!(store.list("2025-08", None).await.unwrap().is_empty());
        assert_eq!(store.list("2025-07", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_same_key_end_done() {
        let store = store().await;
        let k = key("Estabelecimentos0.zip");
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                store.mark_in_progress(&k).await.unwrap();
                if i == 3 {
                    store.mark_done(&k, None).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // Whatever the interleaving, nothing written after `done` sticks.
        store.mark_in_progress(&k).await.unwrap();
        assert!(store.is_done(&k).await.unwrap());
    }
}
