use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::models::{SyncAction, SyncItem, SyncItemPatch, SyncMetadata};
use crate::sync::{QueueStore, StoreError};

const STATUS_QUEUED: &str = "queued";
const STATUS_FAILED: &str = "failed";

const LAST_SYNC_KEY: &str = "last_sync_time";
const DEVICE_ID_KEY: &str = "device_id";

/// SQLite-backed sync queue.
#[derive(Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    entity: String,
    action: String,
    payload: String,
    timestamp: String,
    attempts: i64,
    last_error: Option<String>,
    last_attempt: Option<String>,
    metadata: String,
}

impl QueueRow {
    fn into_item(self) -> Result<SyncItem, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };

        let action: SyncAction = self.action.parse().map_err(corrupt)?;
        let payload = serde_json::from_str(&self.payload)?;
        let metadata: SyncMetadata = serde_json::from_str(&self.metadata)?;
        let timestamp = parse_time(&self.timestamp).map_err(corrupt)?;
        let last_attempt = match &self.last_attempt {
            Some(s) => Some(parse_time(s).map_err(corrupt)?),
            None => None,
        };
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| corrupt(format!("invalid attempts {}", self.attempts)))?;

        Ok(SyncItem {
            id: self.id,
            entity: self.entity,
            action,
            payload,
            timestamp,
            attempts,
            synced: false,
            last_error: self.last_error,
            last_attempt,
            metadata,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", s, e))
}

fn map_insert_error(id: &str, e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Duplicate(id.to_string())
        }
        _ => StoreError::Database(e),
    }
}

impl QueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert(
        tx: &mut Transaction<'_, Sqlite>,
        item: &SyncItem,
        status: &str,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&item.payload)?;
        let metadata = serde_json::to_string(&item.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO sync_queue (id, position, status, entity, action, payload, timestamp, attempts, last_error, last_attempt, metadata)
            VALUES (?, (SELECT COALESCE(MAX(position), 0) + 1 FROM sync_queue), ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(status)
        .bind(&item.entity)
        .bind(item.action.to_string())
        .bind(&payload)
        .bind(item.timestamp.to_rfc3339())
        .bind(item.attempts)
        .bind(&item.last_error)
        .bind(item.last_attempt.map(|t| t.to_rfc3339()))
        .bind(&metadata)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_insert_error(&item.id, e))?;

        Ok(())
    }

    async fn fetch_by_status(&self, status: &str) -> Result<Vec<SyncItem>, StoreError> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            r#"
            SELECT id, entity, action, payload, timestamp, attempts, last_error, last_attempt, metadata
            FROM sync_queue
            WHERE status = ?
            ORDER BY position
            "#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueueRow::into_item).collect()
    }

    async fn count_by_status(&self, status: &str) -> Result<usize, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_queue WHERE status = ?")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Applies a patch to a queued item, optionally moving it to a new status.
    async fn patch_queued(
        &self,
        id: &str,
        patch: &SyncItemPatch,
        new_status: &str,
    ) -> Result<(), StoreError> {
        let payload = patch
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET attempts = MAX(attempts, COALESCE(?, attempts)),
                last_error = COALESCE(?, last_error),
                last_attempt = COALESCE(?, last_attempt),
                payload = COALESCE(?, payload),
                status = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(patch.attempts)
        .bind(&patch.last_error)
        .bind(patch.last_attempt.map(|t| t.to_rfc3339()))
        .bind(&payload)
        .bind(new_status)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM sync_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }
}

impl QueueStore for QueueRepository {
    async fn enqueue(&self, item: &SyncItem) -> Result<String, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::insert(&mut tx, item, STATUS_QUEUED).await?;
        tx.commit().await?;
        Ok(item.id.clone())
    }

    async fn list(&self) -> Result<Vec<SyncItem>, StoreError> {
        self.fetch_by_status(STATUS_QUEUED).await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.count_by_status(STATUS_QUEUED).await
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ? AND status = 'queued'")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update(&self, id: &str, patch: &SyncItemPatch) -> Result<(), StoreError> {
        self.patch_queued(id, patch, STATUS_QUEUED).await
    }

    async fn mark_failed(&self, id: &str, patch: &SyncItemPatch) -> Result<(), StoreError> {
        self.patch_queued(id, patch, STATUS_FAILED).await
    }

    async fn list_failed(&self) -> Result<Vec<SyncItem>, StoreError> {
        self.fetch_by_status(STATUS_FAILED).await
    }

    async fn count_failed(&self) -> Result<usize, StoreError> {
        self.count_by_status(STATUS_FAILED).await
    }

    async fn requeue_failed(&self) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM sync_queue WHERE status = 'failed' ORDER BY position")
                .fetch_all(&mut *tx)
                .await?;

        for (id,) in &ids {
            sqlx::query(
                r#"
                UPDATE sync_queue
                SET status = 'queued',
                    position = (SELECT MAX(position) + 1 FROM sync_queue)
                WHERE id = ?
                "#,
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(ids.len())
    }

    async fn clear_failed(&self) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE status = 'failed'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn replace_all(&self, queue: &[SyncItem], failed: &[SyncItem]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM sync_queue")
            .execute(&mut *tx)
            .await?;

        for item in queue {
            Self::insert(&mut tx, item, STATUS_QUEUED).await?;
        }
        for item in failed {
            Self::insert(&mut tx, item, STATUS_FAILED).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        match self.get_state(LAST_SYNC_KEY).await? {
            Some(value) => parse_time(&value).map(Some).map_err(|reason| StoreError::Corrupt {
                id: LAST_SYNC_KEY.to_string(),
                reason,
            }),
            None => Ok(None),
        }
    }

    async fn set_last_sync_time(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(LAST_SYNC_KEY)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn device_id_or_insert(&self, candidate: &str) -> Result<String, StoreError> {
        sqlx::query("INSERT OR IGNORE INTO sync_state (key, value) VALUES (?, ?)")
            .bind(DEVICE_ID_KEY)
            .bind(candidate)
            .execute(&self.pool)
            .await?;

        self.get_state(DEVICE_ID_KEY)
            .await?
            .ok_or_else(|| StoreError::NotFound(DEVICE_ID_KEY.to_string()))
    }
}
