//! Checksum tree nodes.
//!
//! Each row is one [`ChecksumEntity`] plus the link to its parent, so the
//! interceptor can walk upward and update every ancestor's children map.

use std::collections::BTreeMap;

use sqlx::{SqliteConnection, SqlitePool};

use stockmesh_core::{ChecksumEntity, EntityType};

use super::{from_micros, parse_column, parse_json, to_micros};
use crate::error::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct ChecksumRow {
    entity_type: String,
    entity_id: String,
    content_hash: String,
    children_hash: String,
    full_hash: String,
    child_count: i64,
    children: String,
    parent_type: Option<String>,
    parent_id: Option<String>,
    source_instance: String,
    source_device: Option<String>,
    last_updated: i64,
}

/// A stored node and its parent link.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChecksum {
    pub entity: ChecksumEntity,
    pub parent: Option<(EntityType, String)>,
}

impl TryFrom<ChecksumRow> for StoredChecksum {
    type Error = DbError;

    fn try_from(row: ChecksumRow) -> DbResult<Self> {
        let parent = match (row.parent_type, row.parent_id) {
            (Some(t), Some(id)) => Some((parse_column("parent_type", &t)?, id)),
            _ => None,
        };
        Ok(StoredChecksum {
            entity: ChecksumEntity {
                entity_type: parse_column("entity_type", &row.entity_type)?,
                entity_id: row.entity_id,
                content_hash: row.content_hash,
                children_hash: row.children_hash,
                full_hash: row.full_hash,
                child_count: row.child_count,
                last_updated: from_micros("last_updated", row.last_updated)?,
                source_instance: row.source_instance,
                source_device: row.source_device,
                children: parse_json("children", &row.children)?,
            },
            parent,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT entity_type, entity_id, content_hash, children_hash, full_hash, child_count,
           children, parent_type, parent_id, source_instance, source_device, last_updated
    FROM entity_checksums
"#;

/// Repository for `entity_checksums`.
#[derive(Debug, Clone)]
pub struct ChecksumRepository {
    pool: SqlitePool,
}

impl ChecksumRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ChecksumRepository { pool }
    }

    pub async fn get(&self, entity_type: EntityType, entity_id: &str) -> DbResult<Option<StoredChecksum>> {
        let mut conn = self.pool.acquire().await?;
        self.get_in(&mut conn, entity_type, entity_id).await
    }

    pub async fn get_in(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        entity_id: &str,
    ) -> DbResult<Option<StoredChecksum>> {
        let sql = format!("{SELECT_COLUMNS} WHERE entity_type = ?1 AND entity_id = ?2");
        let row: Option<ChecksumRow> = sqlx::query_as(&sql)
            .bind(entity_type.as_str())
            .bind(entity_id)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(StoredChecksum::try_from).transpose()
    }

    pub async fn upsert_in(
        &self,
        conn: &mut SqliteConnection,
        entity: &ChecksumEntity,
        parent: Option<(EntityType, &str)>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entity_checksums (
                entity_type, entity_id, content_hash, children_hash, full_hash, child_count,
                children, parent_type, parent_id, source_instance, source_device, last_updated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT (entity_type, entity_id) DO UPDATE SET
                content_hash = excluded.content_hash,
                children_hash = excluded.children_hash,
                full_hash = excluded.full_hash,
                child_count = excluded.child_count,
                children = excluded.children,
                parent_type = excluded.parent_type,
                parent_id = excluded.parent_id,
                source_instance = excluded.source_instance,
                source_device = excluded.source_device,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(entity.entity_type.as_str())
        .bind(&entity.entity_id)
        .bind(&entity.content_hash)
        .bind(&entity.children_hash)
        .bind(&entity.full_hash)
        .bind(entity.child_count)
        .bind(serde_json::to_string(&entity.children)?)
        .bind(parent.map(|(t, _)| t.as_str()))
        .bind(parent.map(|(_, id)| id))
        .bind(&entity.source_instance)
        .bind(&entity.source_device)
        .bind(to_micros(entity.last_updated))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn delete_in(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        entity_id: &str,
    ) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM entity_checksums WHERE entity_type = ?1 AND entity_id = ?2")
            .bind(entity_type.as_str())
            .bind(entity_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All nodes of a type, ordered by id.
    pub async fn list(&self, entity_type: EntityType) -> DbResult<Vec<ChecksumEntity>> {
        let sql = format!("{SELECT_COLUMNS} WHERE entity_type = ?1 ORDER BY entity_id");
        let rows: Vec<ChecksumRow> = sqlx::query_as(&sql)
            .bind(entity_type.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| StoredChecksum::try_from(r).map(|s| s.entity))
            .collect()
    }

    /// `entity_id → full_hash` for a type. Input to negotiation and Merkle.
    pub async fn full_hashes(&self, entity_type: EntityType) -> DbResult<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT entity_id, full_hash FROM entity_checksums WHERE entity_type = ?1 ORDER BY entity_id",
        )
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_upsert_keeps_children_and_parent() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.checksums();

        let mut node = ChecksumEntity::new(EntityType::Location, "WH/A");
        node.set_content_hash("c");
        node.add_child("shelf1", "h1");

        let mut conn = db.pool().acquire().await.unwrap();
        repo.upsert_in(&mut conn, &node, Some((EntityType::Location, "WH")))
            .await
            .unwrap();
        let stored = repo.get_in(&mut conn, EntityType::Location, "WH/A").await.unwrap().unwrap();
        drop(conn);

        assert_eq!(stored.entity.children.get("shelf1").map(String::as_str), Some("h1"));
        assert_eq!(stored.entity.full_hash, node.full_hash);
        assert_eq!(stored.parent, Some((EntityType::Location, "WH".to_string())));

        let hashes = repo.full_hashes(EntityType::Location).await.unwrap();
        assert_eq!(hashes.get("WH/A"), Some(&node.full_hash));
    }
}
