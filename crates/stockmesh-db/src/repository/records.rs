//! Replicated entity payloads.
//!
//! `entity_records` stands in for the warehouse domain tables: one JSON
//! document per (entity type, entity id). Deleting an entity removes its
//! payload; the tombstone lives on in `entity_metadata`.

use chrono::Utc;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use stockmesh_core::{records::is_active, EntityRecord, EntityType};

use super::{from_micros, parse_column, parse_json, to_micros};
use crate::error::DbResult;

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    entity_type: String,
    entity_id: String,
    data: String,
    updated_at: i64,
}

impl TryFrom<RecordRow> for EntityRecord {
    type Error = crate::error::DbError;

    fn try_from(row: RecordRow) -> DbResult<Self> {
        Ok(EntityRecord {
            entity_type: parse_column("entity_type", &row.entity_type)?,
            entity_id: row.entity_id,
            data: parse_json("data", &row.data)?,
            updated_at: from_micros("updated_at", row.updated_at)?,
        })
    }
}

/// Repository for `entity_records`.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        RecordRepository { pool }
    }

    pub async fn get(&self, entity_type: EntityType, entity_id: &str) -> DbResult<Option<EntityRecord>> {
        let mut conn = self.pool.acquire().await?;
        self.get_in(&mut conn, entity_type, entity_id).await
    }

    pub async fn get_in(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        entity_id: &str,
    ) -> DbResult<Option<EntityRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(
            r#"
            SELECT entity_type, entity_id, data, updated_at
            FROM entity_records
            WHERE entity_type = ?1 AND entity_id = ?2
            "#,
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(EntityRecord::try_from).transpose()
    }

    /// Inserts or replaces the payload.
    pub async fn upsert_in(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        entity_id: &str,
        data: &Value,
    ) -> DbResult<()> {
        let json = serde_json::to_string(data)?;
        debug!(entity_type = %entity_type, entity_id = %entity_id, "Storing record");

        sqlx::query(
            r#"
            INSERT INTO entity_records (entity_type, entity_id, data, active, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (entity_type, entity_id) DO UPDATE SET
                data = excluded.data,
                active = excluded.active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .bind(json)
        .bind(is_active(data))
        .bind(to_micros(Utc::now()))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Returns true if a payload was removed.
    pub async fn delete_in(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        entity_id: &str,
    ) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM entity_records WHERE entity_type = ?1 AND entity_id = ?2")
            .bind(entity_type.as_str())
            .bind(entity_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All payloads of one type, ordered by id.
    pub async fn list(&self, entity_type: EntityType) -> DbResult<Vec<EntityRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT entity_type, entity_id, data, updated_at
            FROM entity_records
            WHERE entity_type = ?1
            ORDER BY entity_id
            "#,
        )
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EntityRecord::try_from).collect()
    }

    pub async fn count(&self, entity_type: EntityType) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entity_records WHERE entity_type = ?1")
            .bind(entity_type.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
