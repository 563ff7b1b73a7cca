//! # Watermark Repository
//!
//! Progress per (route, entity type).
//!
//! ```text
//! pull chunk ──► apply record 1 ─┐
//!                apply record 2 ─┤  each in its own transaction together
//!                ...             │  with advance_in(route, type, modified_at)
//!                apply record N ─┘
//! cycle end  ──► record_cycle(status, counts, duration)
//! ```
//!
//! `advance_in` never moves a watermark backwards.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use stockmesh_core::{EntityType, Watermark};

use super::{from_micros, opt_from_micros, parse_column, to_micros};
use crate::error::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct WatermarkRow {
    route_id: String,
    entity_type: String,
    last_sync_at: Option<i64>,
    last_full_sync_at: Option<i64>,
    status: String,
    records_synced: i64,
    conflicts_detected: i64,
    duration_ms: i64,
    error: Option<String>,
    updated_at: i64,
}

impl TryFrom<WatermarkRow> for Watermark {
    type Error = DbError;

    fn try_from(row: WatermarkRow) -> DbResult<Self> {
        Ok(Watermark {
            route_id: row.route_id,
            entity_type: parse_column("entity_type", &row.entity_type)?,
            last_sync_at: opt_from_micros("last_sync_at", row.last_sync_at)?,
            last_full_sync_at: opt_from_micros("last_full_sync_at", row.last_full_sync_at)?,
            status: row.status,
            records_synced: row.records_synced,
            conflicts_detected: row.conflicts_detected,
            duration_ms: row.duration_ms,
            error: row.error,
            updated_at: from_micros("updated_at", row.updated_at)?,
        })
    }
}

/// Outcome of one (route, entity type) cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// `success`, `error` or `partial`.
    pub status: String,
    pub records_synced: i64,
    pub conflicts_detected: i64,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub full_sync: bool,
}

/// Repository for `sync_watermarks`.
#[derive(Debug, Clone)]
pub struct WatermarkRepository {
    pool: SqlitePool,
}

impl WatermarkRepository {
    pub fn new(pool: SqlitePool) -> Self {
        WatermarkRepository { pool }
    }

    pub async fn get(&self, route_id: &str, entity_type: EntityType) -> DbResult<Option<Watermark>> {
        let row: Option<WatermarkRow> =
            sqlx::query_as("SELECT * FROM sync_watermarks WHERE route_id = ?1 AND entity_type = ?2")
                .bind(route_id)
                .bind(entity_type.as_str())
                .fetch_optional(&self.pool)
                .await?;
        row.map(Watermark::try_from).transpose()
    }

    /// The `since` value for the next pull, if any.
    pub async fn since(&self, route_id: &str, entity_type: EntityType) -> DbResult<Option<DateTime<Utc>>> {
        Ok(self.get(route_id, entity_type).await?.and_then(|w| w.last_sync_at))
    }

    /// Moves the watermark forward to `applied_at`. Older values are ignored.
    pub async fn advance_in(
        &self,
        conn: &mut SqliteConnection,
        route_id: &str,
        entity_type: EntityType,
        applied_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let ts = to_micros(applied_at);
        sqlx::query(
            r#"
            INSERT INTO sync_watermarks (route_id, entity_type, last_sync_at, status, updated_at)
            VALUES (?1, ?2, ?3, 'syncing', ?4)
            ON CONFLICT (route_id, entity_type) DO UPDATE SET
                last_sync_at = MAX(COALESCE(sync_watermarks.last_sync_at, excluded.last_sync_at), excluded.last_sync_at),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(route_id)
        .bind(entity_type.as_str())
        .bind(ts)
        .bind(to_micros(Utc::now()))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Stores the cycle summary without touching `last_sync_at`.
    pub async fn record_cycle(&self, route_id: &str, entity_type: EntityType, report: &CycleReport) -> DbResult<()> {
        let now = to_micros(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO sync_watermarks (
                route_id, entity_type, last_full_sync_at, status, records_synced,
                conflicts_detected, duration_ms, error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (route_id, entity_type) DO UPDATE SET
                last_full_sync_at = COALESCE(excluded.last_full_sync_at, sync_watermarks.last_full_sync_at),
                status = excluded.status,
                records_synced = excluded.records_synced,
                conflicts_detected = excluded.conflicts_detected,
                duration_ms = excluded.duration_ms,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(route_id)
        .bind(entity_type.as_str())
        .bind(if report.full_sync { Some(now) } else { None })
        .bind(&report.status)
        .bind(report.records_synced)
        .bind(report.conflicts_detected)
        .bind(report.duration_ms)
        .bind(&report.error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Forgets progress for a route so the next cycle pulls everything.
    pub async fn reset(&self, route_id: &str, entity_type: Option<EntityType>) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE sync_watermarks SET last_sync_at = NULL WHERE route_id = ?1 AND (?2 IS NULL OR entity_type = ?2)",
        )
        .bind(route_id)
        .bind(entity_type.map(|t| t.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn list(&self) -> DbResult<Vec<Watermark>> {
        let rows: Vec<WatermarkRow> = sqlx::query_as("SELECT * FROM sync_watermarks ORDER BY route_id, entity_type")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Watermark::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::Duration;

    #[tokio::test]
    async fn test_advance_is_monotonic() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.watermarks();
        let t1 = Utc::now();
        let t0 = t1 - Duration::seconds(10);

        let mut conn = db.pool().acquire().await.unwrap();
        repo.advance_in(&mut conn, "r1", EntityType::Tracking, t1).await.unwrap();
        repo.advance_in(&mut conn, "r1", EntityType::Tracking, t0).await.unwrap();
        drop(conn);

        let since = repo.since("r1", EntityType::Tracking).await.unwrap().unwrap();
        assert_eq!(since.timestamp_micros(), t1.timestamp_micros());
    }

    #[tokio::test]
    async fn test_record_cycle_keeps_watermark() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.watermarks();
        let t1 = Utc::now();
        {
            let mut tx = db.begin().await.unwrap();
            repo.advance_in(&mut tx, "r1", EntityType::Product, t1).await.unwrap();
            tx.commit().await.unwrap();
        }
        repo.record_cycle(
            "r1",
            EntityType::Product,
            &CycleReport { status: "success".into(), records_synced: 4, full_sync: true, ..Default::default() },
        )
        .await
        .unwrap();

        let wm = repo.get("r1", EntityType::Product).await.unwrap().unwrap();
        assert_eq!(wm.records_synced, 4);
        assert!(wm.last_full_sync_at.is_some());
        assert_eq!(wm.last_sync_at.map(|t| t.timestamp_micros()), Some(t1.timestamp_micros()));

        repo.reset("r1", None).await.unwrap();
        assert!(repo.since("r1", EntityType::Product).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rolled_back_advance_leaves_no_trace() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.watermarks();
        {
            let mut tx = db.begin().await.unwrap();
            repo.advance_in(&mut tx, "r1", EntityType::Lot, Utc::now()).await.unwrap();
            tx.rollback().await.unwrap();
        }
        assert!(repo.since("r1", EntityType::Lot).await.unwrap().is_none());
    }
}
