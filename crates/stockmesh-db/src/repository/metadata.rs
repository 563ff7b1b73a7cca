//! # Entity Metadata Repository
//!
//! Durable `EntityMetadata` rows, tombstones included.
//!
//! ## Pull Query
//! ```text
//! first chunk:   modified_at >= since                  (inclusive)
//! next chunks:   (modified_at, entity_id) > (ts, id)   (keyset cursor)
//! order:         modified_at, entity_id
//! ```
//! The first chunk is inclusive so that a record sharing the watermark's
//! instant is never skipped. Re-reading one is harmless: applying an
//! identical version is a no-op.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use stockmesh_core::{EntityMetadata, EntityType};

use super::{from_micros, opt_from_micros, parse_column, parse_json, to_micros};
use crate::error::{DbError, DbResult};

const SELECT_COLUMNS: &str = r#"
    SELECT m.entity_type, m.entity_id, m.version, m.updated_at, m.modified_at,
           m.source, m.source_priority, m.instance_id, m.device_id, m.user_id,
           m.content_hash, m.hierarchy_hash, m.vector_clock, m.parent_type, m.parent_id,
           m.synced_routes, m.sync_attempts, m.last_sync_error, m.has_conflict,
           m.conflict_with, m.deleted, m.deleted_at
    FROM entity_metadata m
"#;

#[derive(Debug, sqlx::FromRow)]
struct MetadataRow {
    entity_type: String,
    entity_id: String,
    version: i64,
    updated_at: i64,
    modified_at: i64,
    source: String,
    source_priority: i32,
    instance_id: String,
    device_id: Option<String>,
    user_id: Option<String>,
    content_hash: String,
    hierarchy_hash: String,
    vector_clock: String,
    parent_type: Option<String>,
    parent_id: Option<String>,
    synced_routes: String,
    sync_attempts: i32,
    last_sync_error: Option<String>,
    has_conflict: bool,
    conflict_with: String,
    deleted: bool,
    deleted_at: Option<i64>,
}

impl TryFrom<MetadataRow> for EntityMetadata {
    type Error = DbError;

    fn try_from(row: MetadataRow) -> DbResult<Self> {
        Ok(EntityMetadata {
            entity_type: parse_column("entity_type", &row.entity_type)?,
            entity_id: row.entity_id,
            version: row.version,
            updated_at: from_micros("updated_at", row.updated_at)?,
            modified_at: from_micros("modified_at", row.modified_at)?,
            source: parse_column("source", &row.source)?,
            source_priority: row.source_priority,
            instance_id: row.instance_id,
            device_id: row.device_id,
            user_id: row.user_id,
            content_hash: row.content_hash,
            hierarchy_hash: row.hierarchy_hash,
            vector_clock: parse_json("vector_clock", &row.vector_clock)?,
            parent_type: row
                .parent_type
                .as_deref()
                .map(|t| parse_column("parent_type", t))
                .transpose()?,
            parent_id: row.parent_id,
            synced_routes: parse_json("synced_routes", &row.synced_routes)?,
            sync_attempts: row.sync_attempts,
            last_sync_error: row.last_sync_error,
            has_conflict: row.has_conflict,
            conflict_with: parse_json("conflict_with", &row.conflict_with)?,
            deleted: row.deleted,
            deleted_at: opt_from_micros("deleted_at", row.deleted_at)?,
        })
    }
}

/// Parameters of one pull chunk.
#[derive(Debug, Clone, Default)]
pub struct ChangeQuery<'a> {
    pub since: Option<DateTime<Utc>>,
    /// Resume strictly after `(since, after_id)`.
    pub after_id: Option<&'a str>,
    pub limit: i64,
    /// Skip tombstones and records with `"active": false`.
    pub active_only: bool,
}

/// Repository for `entity_metadata`.
#[derive(Debug, Clone)]
pub struct MetadataRepository {
    pool: SqlitePool,
}

impl MetadataRepository {
    pub fn new(pool: SqlitePool) -> Self {
        MetadataRepository { pool }
    }

    pub async fn get(&self, entity_type: EntityType, entity_id: &str) -> DbResult<Option<EntityMetadata>> {
        let mut conn = self.pool.acquire().await?;
        self.get_in(&mut conn, entity_type, entity_id).await
    }

    pub async fn get_in(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        entity_id: &str,
    ) -> DbResult<Option<EntityMetadata>> {
        let sql = format!("{SELECT_COLUMNS} WHERE m.entity_type = ?1 AND m.entity_id = ?2");
        let row: Option<MetadataRow> = sqlx::query_as(&sql)
            .bind(entity_type.as_str())
            .bind(entity_id)
            .fetch_optional(&mut *conn)
            .await?;

        row.map(EntityMetadata::try_from).transpose()
    }

    pub async fn upsert(&self, meta: &EntityMetadata) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        self.upsert_in(&mut conn, meta).await
    }

    /// Inserts or fully replaces the row for `(entity_type, entity_id)`.
    pub async fn upsert_in(&self, conn: &mut SqliteConnection, meta: &EntityMetadata) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entity_metadata (
                entity_type, entity_id, version, updated_at, modified_at,
                source, source_priority, instance_id, device_id, user_id,
                content_hash, hierarchy_hash, vector_clock, parent_type, parent_id,
                synced_routes, sync_attempts, last_sync_error, has_conflict,
                conflict_with, deleted, deleted_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22
            )
            ON CONFLICT (entity_type, entity_id) DO UPDATE SET
                version = excluded.version,
                updated_at = excluded.updated_at,
                modified_at = excluded.modified_at,
                source = excluded.source,
                source_priority = excluded.source_priority,
                instance_id = excluded.instance_id,
                device_id = excluded.device_id,
                user_id = excluded.user_id,
                content_hash = excluded.content_hash,
                hierarchy_hash = excluded.hierarchy_hash,
                vector_clock = excluded.vector_clock,
                parent_type = excluded.parent_type,
                parent_id = excluded.parent_id,
                synced_routes = excluded.synced_routes,
                sync_attempts = excluded.sync_attempts,
                last_sync_error = excluded.last_sync_error,
                has_conflict = excluded.has_conflict,
                conflict_with = excluded.conflict_with,
                deleted = excluded.deleted,
                deleted_at = excluded.deleted_at
            "#,
        )
        .bind(meta.entity_type.as_str())
        .bind(&meta.entity_id)
        .bind(meta.version)
        .bind(to_micros(meta.updated_at))
        .bind(to_micros(meta.modified_at))
        .bind(meta.source.as_str())
        .bind(meta.source_priority)
        .bind(&meta.instance_id)
        .bind(&meta.device_id)
        .bind(&meta.user_id)
        .bind(&meta.content_hash)
        .bind(&meta.hierarchy_hash)
        .bind(serde_json::to_string(&meta.vector_clock)?)
        .bind(meta.parent_type.map(|t| t.as_str()))
        .bind(&meta.parent_id)
        .bind(serde_json::to_string(&meta.synced_routes)?)
        .bind(meta.sync_attempts)
        .bind(&meta.last_sync_error)
        .bind(meta.has_conflict)
        .bind(serde_json::to_string(&meta.conflict_with)?)
        .bind(meta.deleted)
        .bind(meta.deleted_at.map(to_micros))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// One chunk of changed entities, ordered by `(modified_at, entity_id)`.
    pub async fn changed_since(
        &self,
        entity_type: EntityType,
        query: &ChangeQuery<'_>,
    ) -> DbResult<Vec<EntityMetadata>> {
        let since = query.since.map(to_micros).unwrap_or(i64::MIN);

        let mut sql = format!("{SELECT_COLUMNS} WHERE m.entity_type = ?1");
        if query.after_id.is_some() {
            sql.push_str(" AND (m.modified_at > ?2 OR (m.modified_at = ?2 AND m.entity_id > ?3))");
        } else {
            sql.push_str(" AND m.modified_at >= ?2");
        }
        if query.active_only {
            sql.push_str(
                r#" AND m.deleted = 0 AND EXISTS (
                    SELECT 1 FROM entity_records r
                    WHERE r.entity_type = m.entity_type AND r.entity_id = m.entity_id AND r.active = 1
                )"#,
            );
        }
        sql.push_str(" ORDER BY m.modified_at, m.entity_id LIMIT ?4");

        let rows: Vec<MetadataRow> = sqlx::query_as(&sql)
            .bind(entity_type.as_str())
            .bind(since)
            .bind(query.after_id)
            .bind(query.limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(EntityMetadata::try_from).collect()
    }

    /// Metadata for the given ids; unknown ids are skipped.
    pub async fn by_ids(&self, entity_type: EntityType, ids: &[String]) -> DbResult<Vec<EntityMetadata>> {
        let mut conn = self.pool.acquire().await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(meta) = self.get_in(&mut conn, entity_type, id).await? {
                out.push(meta);
            }
        }
        Ok(out)
    }

    /// Live (non-tombstoned) entities whose parent is the given entity.
    pub async fn children_of_in(
        &self,
        conn: &mut SqliteConnection,
        parent_type: EntityType,
        parent_id: &str,
    ) -> DbResult<Vec<EntityMetadata>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE m.parent_type = ?1 AND m.parent_id = ?2 AND m.deleted = 0 ORDER BY m.entity_id"
        );
        let rows: Vec<MetadataRow> = sqlx::query_as(&sql)
            .bind(parent_type.as_str())
            .bind(parent_id)
            .fetch_all(&mut *conn)
            .await?;
        rows.into_iter().map(EntityMetadata::try_from).collect()
    }

    /// Entities currently flagged as conflicted.
    pub async fn conflicted(&self, limit: i64) -> DbResult<Vec<EntityMetadata>> {
        let sql = format!("{SELECT_COLUMNS} WHERE m.has_conflict = 1 ORDER BY m.modified_at DESC LIMIT ?1");
        let rows: Vec<MetadataRow> = sqlx::query_as(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.into_iter().map(EntityMetadata::try_from).collect()
    }

    /// Deletes tombstones older than `cutoff`. Returns how many were purged.
    pub async fn purge_tombstones(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM entity_metadata WHERE deleted = 1 AND deleted_at < ?1")
            .bind(to_micros(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// `(live, tombstoned)` counts for one type.
    pub async fn counts(&self, entity_type: EntityType) -> DbResult<(i64, i64)> {
        let (live, dead): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN deleted = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN deleted = 1 THEN 1 ELSE 0 END), 0)
            FROM entity_metadata WHERE entity_type = ?1
            "#,
        )
        .bind(entity_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok((live, dead))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::Duration;
    use stockmesh_core::{TruthSource, VectorClock};

    fn meta(id: &str, modified_at: DateTime<Utc>) -> EntityMetadata {
        let mut m = EntityMetadata::new(EntityType::Tracking, id, "nodeA");
        m.increment_version("nodeA");
        m.set_source(TruthSource::Physical, Some("pda-1".into()));
        m.modified_at = modified_at;
        m.content_hash = format!("hash-{id}");
        m
    }

    #[tokio::test]
    async fn test_upsert_roundtrip_keeps_clock_and_parent() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut m = meta("TEST-1", Utc::now());
        m.vector_clock = VectorClock::from([("nodeA", 3), ("nodeB", 2)]);
        m.set_parent(Some((EntityType::Shipment, "SHIP-1".into())));
        m.mark_synced("route-1");
        db.metadata().upsert(&m).await.unwrap();

        let back = db.metadata().get(EntityType::Tracking, "TEST-1").await.unwrap().unwrap();
        assert_eq!(back.vector_clock, m.vector_clock);
        assert_eq!(back.parent(), Some((EntityType::Shipment, "SHIP-1")));
        assert_eq!(back.source, TruthSource::Physical);
        assert_eq!(back.device_id.as_deref(), Some("pda-1"));
        assert!(back.synced_routes.contains_key("route-1"));
    }

    #[tokio::test]
    async fn test_changed_since_is_inclusive_then_keyset() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let base = Utc::now();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            db.metadata().upsert(&meta(id, base + Duration::seconds(i as i64))).await.unwrap();
        }
        let repo = db.metadata();

        let since = base + Duration::seconds(1);
        let first = repo
            .changed_since(EntityType::Tracking, &ChangeQuery { since: Some(since), limit: 10, ..Default::default() })
            .await
            .unwrap();
        let ids: Vec<_> = first.iter().map(|m| m.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let page = repo
            .changed_since(EntityType::Tracking, &ChangeQuery { since: None, limit: 2, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        let last = page.last().unwrap();
        let rest = repo
            .changed_since(
                EntityType::Tracking,
                &ChangeQuery {
                    since: Some(last.modified_at),
                    after_id: Some(&last.entity_id),
                    limit: 2,
                    active_only: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].entity_id, "c");
    }

    #[tokio::test]
    async fn test_active_only_skips_tombstones() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let live = meta("live", Utc::now());
        let mut dead = meta("dead", Utc::now());
        dead.tombstone();
        db.metadata().upsert(&live).await.unwrap();
        db.metadata().upsert(&dead).await.unwrap();
        {
            let mut conn = db.pool().acquire().await.unwrap();
            db.records()
                .upsert_in(&mut conn, EntityType::Tracking, "live", &serde_json::json!({"code": "x"}))
                .await
                .unwrap();
        }

        let rows = db
            .metadata()
            .changed_since(EntityType::Tracking, &ChangeQuery { active_only: true, limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_id, "live");
        assert_eq!(db.metadata().counts(EntityType::Tracking).await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn test_purge_tombstones_respects_cutoff() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut old = meta("old", Utc::now());
        old.tombstone();
        old.deleted_at = Some(Utc::now() - Duration::days(40));
        let mut recent = meta("recent", Utc::now());
        recent.tombstone();
        db.metadata().upsert(&old).await.unwrap();
        db.metadata().upsert(&recent).await.unwrap();

        let purged = db.metadata().purge_tombstones(Utc::now() - Duration::days(30)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(db.metadata().get(EntityType::Tracking, "recent").await.unwrap().is_some());
    }
}
