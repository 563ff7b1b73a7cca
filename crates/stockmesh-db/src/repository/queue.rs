//! # Sync Queue Repository
//!
//! Debounced outbound notifications.
//!
//! ## Debounce
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  t=0ms    write #1  → INSERT pending, scheduled_at = 1000ms            │
//! │  t=300ms  write #2  → same row, scheduled_at = 1300ms                  │
//! │  t=900ms  write #3  → same row, scheduled_at = 1900ms                  │
//! │  t=1900ms due()     → one entry, pushed once                           │
//! │                                                                         │
//! │  A partial UNIQUE index on (entity_type, entity_id) WHERE pending      │
//! │  guarantees at most one pending row per entity.                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use stockmesh_core::{EntityType, QueueEntry, QueueStatus, WriteOp};

use super::{from_micros, opt_from_micros, parse_column, to_micros};
use crate::error::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    id: String,
    entity_type: String,
    entity_id: String,
    operation: WriteOp,
    priority: i32,
    status: QueueStatus,
    retry_count: i32,
    max_retries: i32,
    error_message: Option<String>,
    created_at: i64,
    scheduled_at: i64,
    processed_at: Option<i64>,
}

impl TryFrom<QueueRow> for QueueEntry {
    type Error = DbError;

    fn try_from(row: QueueRow) -> DbResult<Self> {
        Ok(QueueEntry {
            id: row.id,
            entity_type: parse_column("entity_type", &row.entity_type)?,
            entity_id: row.entity_id,
            operation: row.operation,
            priority: row.priority,
            status: row.status,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            error_message: row.error_message,
            created_at: from_micros("created_at", row.created_at)?,
            scheduled_at: from_micros("scheduled_at", row.scheduled_at)?,
            processed_at: opt_from_micros("processed_at", row.processed_at)?,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, entity_type, entity_id, operation, priority, status, retry_count,
           max_retries, error_message, created_at, scheduled_at, processed_at
    FROM sync_queue
"#;

/// What to enqueue.
#[derive(Debug, Clone)]
pub struct Enqueue<'a> {
    pub entity_type: EntityType,
    pub entity_id: &'a str,
    pub operation: WriteOp,
    pub priority: i32,
    /// Debounce window.
    pub buffer: Duration,
    pub max_retries: i32,
}

/// Repository for `sync_queue`.
#[derive(Debug, Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        QueueRepository { pool }
    }

    pub async fn enqueue(&self, item: &Enqueue<'_>) -> DbResult<QueueEntry> {
        let mut conn = self.pool.acquire().await?;
        self.enqueue_in(&mut conn, item).await
    }

    /// Inserts a pending entry or pushes back the existing one.
    ///
    /// A pending `create` followed by an `update` stays a `create`. Any
    /// `delete` wins.
    pub async fn enqueue_in(&self, conn: &mut SqliteConnection, item: &Enqueue<'_>) -> DbResult<QueueEntry> {
        let now = Utc::now();
        let scheduled = now + item.buffer;

        sqlx::query(
            r#"
            INSERT INTO sync_queue (
                id, entity_type, entity_id, operation, priority, status,
                retry_count, max_retries, created_at, scheduled_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7, ?8)
            ON CONFLICT (entity_type, entity_id) WHERE status = 'pending' DO UPDATE SET
                operation = CASE
                    WHEN sync_queue.operation = 'create' AND excluded.operation = 'update'
                        THEN 'create'
                    ELSE excluded.operation
                END,
                priority = MIN(sync_queue.priority, excluded.priority),
                scheduled_at = excluded.scheduled_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(item.entity_type.as_str())
        .bind(item.entity_id)
        .bind(item.operation)
        .bind(item.priority)
        .bind(item.max_retries)
        .bind(to_micros(now))
        .bind(to_micros(scheduled))
        .execute(&mut *conn)
        .await?;

        debug!(
            entity_type = %item.entity_type,
            entity_id = %item.entity_id,
            operation = %item.operation,
            "Queued for sync"
        );

        let sql = format!("{SELECT_COLUMNS} WHERE entity_type = ?1 AND entity_id = ?2 AND status = 'pending'");
        let row: QueueRow = sqlx::query_as(&sql)
            .bind(item.entity_type.as_str())
            .bind(item.entity_id)
            .fetch_one(&mut *conn)
            .await?;
        row.try_into()
    }

    /// Pending entries whose debounce window has elapsed, most urgent first.
    pub async fn due(&self, now: DateTime<Utc>, limit: i64) -> DbResult<Vec<QueueEntry>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = 'pending' AND scheduled_at <= ?1 ORDER BY priority, scheduled_at LIMIT ?2"
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(to_micros(now))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(QueueEntry::try_from).collect()
    }

    /// Pending entries of one type regardless of schedule.
    pub async fn pending_for(&self, entity_type: EntityType, limit: i64) -> DbResult<Vec<QueueEntry>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = 'pending' AND entity_type = ?1 ORDER BY scheduled_at LIMIT ?2"
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(entity_type.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(QueueEntry::try_from).collect()
    }

    /// Marks an entry completed unless a newer write re-armed it meanwhile.
    ///
    /// Returns false when the entry was re-armed and must stay pending.
    pub async fn mark_completed(&self, entry: &QueueEntry) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET status = 'completed', processed_at = ?3, error_message = NULL
            WHERE id = ?1 AND status = 'pending' AND scheduled_at = ?2
            "#,
        )
        .bind(&entry.id)
        .bind(to_micros(entry.scheduled_at))
        .bind(to_micros(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records a failed push and reschedules after `retry_after`.
    ///
    /// The entry becomes `failed` once `retry_count` reaches `max_retries`.
    pub async fn mark_failed(&self, id: &str, error: &str, retry_after: Duration) -> DbResult<QueueStatus> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE sync_queue SET
                retry_count = retry_count + 1,
                error_message = ?2,
                scheduled_at = ?3,
                status = CASE WHEN retry_count + 1 >= max_retries THEN 'failed' ELSE 'pending' END,
                processed_at = CASE WHEN retry_count + 1 >= max_retries THEN ?4 ELSE NULL END
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(to_micros(now + retry_after))
        .bind(to_micros(now))
        .execute(&self.pool)
        .await?;

        let status: Option<QueueStatus> = sqlx::query_scalar("SELECT status FROM sync_queue WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let status = status.ok_or_else(|| DbError::not_found("QueueEntry", id))?;
        if status == QueueStatus::Failed {
            warn!(queue_id = %id, error = %error, "Queue entry exhausted its retries");
        }
        Ok(status)
    }

    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Deletes completed/failed entries processed before `cutoff`.
    pub async fn purge_processed(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE status != 'pending' AND processed_at < ?1")
            .bind(to_micros(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
