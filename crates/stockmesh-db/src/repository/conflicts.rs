//! Retained conflict artifacts.
//!
//! Both versions of a conflicting entity are kept as JSON so an operator can
//! inspect or override the automatic decision later.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use stockmesh_core::{ConflictStatus, EntityMetadata, EntityType, SyncConflict};

use super::{from_micros, opt_from_micros, parse_column, parse_json, to_micros};
use crate::error::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct ConflictRow {
    id: String,
    entity_type: String,
    entity_id: String,
    conflict_type: String,
    local_version: String,
    remote_version: String,
    local_data: Option<String>,
    remote_data: Option<String>,
    winner: Option<String>,
    strategy: String,
    reason: String,
    status: ConflictStatus,
    resolved_by: Option<String>,
    resolved_at: Option<i64>,
    created_at: i64,
}

impl TryFrom<ConflictRow> for SyncConflict {
    type Error = DbError;

    fn try_from(row: ConflictRow) -> DbResult<Self> {
        Ok(SyncConflict {
            id: row.id,
            entity_type: parse_column("entity_type", &row.entity_type)?,
            entity_id: row.entity_id,
            conflict_type: row.conflict_type,
            local_version: parse_json("local_version", &row.local_version)?,
            remote_version: parse_json("remote_version", &row.remote_version)?,
            local_data: row
                .local_data
                .as_deref()
                .map(|d| parse_json("local_data", d))
                .transpose()?,
            remote_data: row
                .remote_data
                .as_deref()
                .map(|d| parse_json("remote_data", d))
                .transpose()?,
            winner: row.winner,
            strategy: row.strategy,
            reason: row.reason,
            status: row.status,
            resolved_by: row.resolved_by,
            resolved_at: opt_from_micros("resolved_at", row.resolved_at)?,
            created_at: from_micros("created_at", row.created_at)?,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, entity_type, entity_id, conflict_type, local_version, remote_version,
           local_data, remote_data, winner, strategy, reason, status, resolved_by,
           resolved_at, created_at
    FROM sync_conflicts
"#;

/// Repository for `sync_conflicts`.
#[derive(Debug, Clone)]
pub struct ConflictRepository {
    pool: SqlitePool,
}

impl ConflictRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ConflictRepository { pool }
    }

    pub async fn insert_in(&self, conn: &mut SqliteConnection, conflict: &SyncConflict) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_conflicts (
                id, entity_type, entity_id, conflict_type, local_version, remote_version,
                local_data, remote_data, winner, strategy, reason, status, resolved_by,
                resolved_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&conflict.id)
        .bind(conflict.entity_type.as_str())
        .bind(&conflict.entity_id)
        .bind(&conflict.conflict_type)
        .bind(serde_json::to_string(&conflict.local_version)?)
        .bind(serde_json::to_string(&conflict.remote_version)?)
        .bind(conflict.local_data.as_ref().map(serde_json::to_string).transpose()?)
        .bind(conflict.remote_data.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&conflict.winner)
        .bind(&conflict.strategy)
        .bind(&conflict.reason)
        .bind(conflict.status)
        .bind(&conflict.resolved_by)
        .bind(conflict.resolved_at.map(to_micros))
        .bind(to_micros(conflict.created_at))
        .execute(&mut *conn)
        .await?;

        info!(
            conflict_id = %conflict.id,
            entity_type = %conflict.entity_type,
            entity_id = %conflict.entity_id,
            conflict_type = %conflict.conflict_type,
            status = %conflict.status,
            "Conflict recorded"
        );
        Ok(())
    }

    pub async fn get(&self, id: &str) -> DbResult<SyncConflict> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let row: Option<ConflictRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.ok_or_else(|| DbError::not_found("Conflict", id))?.try_into()
    }

    /// Conflicts in the given status, newest first.
    pub async fn list(&self, status: ConflictStatus, limit: i64) -> DbResult<Vec<SyncConflict>> {
        let sql = format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2");
        let rows: Vec<ConflictRow> = sqlx::query_as(&sql)
            .bind(status)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(SyncConflict::try_from).collect()
    }

    pub async fn for_entity(&self, entity_type: EntityType, entity_id: &str) -> DbResult<Vec<SyncConflict>> {
        let sql = format!("{SELECT_COLUMNS} WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY created_at");
        let rows: Vec<ConflictRow> = sqlx::query_as(&sql)
            .bind(entity_type.as_str())
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(SyncConflict::try_from).collect()
    }

    /// Automatically resolved artifacts in which `meta`'s version was one of
    /// the branches. They travel with that version so the peer holding the
    /// other branch keeps the same artifact.
    pub async fn carried_by(&self, meta: &EntityMetadata) -> DbResult<Vec<SyncConflict>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE entity_type = ?1 AND entity_id = ?2 AND status = 'resolved' \
             AND resolved_by LIKE 'auto:%' ORDER BY created_at"
        );
        let rows: Vec<ConflictRow> = sqlx::query_as(&sql)
            .bind(meta.entity_type.as_str())
            .bind(&meta.entity_id)
            .fetch_all(&self.pool)
            .await?;
        let version_id = meta.version_id();
        let mut out = Vec::new();
        for row in rows {
            let conflict = SyncConflict::try_from(row)?;
            if conflict.involves(&version_id) {
                out.push(conflict);
            }
        }
        Ok(out)
    }

    pub async fn exists_in(&self, conn: &mut SqliteConnection, id: &str) -> DbResult<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT id FROM sync_conflicts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(found.is_some())
    }

    /// Closes a pending conflict. Returns false if it was not pending.
    pub async fn close_in(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        status: ConflictStatus,
        winner: Option<&str>,
        resolved_by: &str,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_conflicts SET
                status = ?2,
                winner = COALESCE(?3, winner),
                resolved_by = ?4,
                resolved_at = ?5
            WHERE id = ?1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(winner)
        .bind(resolved_by)
        .bind(to_micros(Utc::now()))
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_conflicts WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use serde_json::json;
    use stockmesh_core::EntityMetadata;

    fn conflict(id: &str) -> SyncConflict {
        let local = EntityMetadata::new(EntityType::Location, "Shelf A", "nodeA");
        let remote = EntityMetadata::new(EntityType::Location, "Shelf A", "nodeB");
        SyncConflict {
            id: id.to_string(),
            entity_type: EntityType::Location,
            entity_id: "Shelf A".into(),
            conflict_type: "concurrent_update".into(),
            local_version: local,
            remote_version: remote,
            local_data: Some(json!({"name": "A"})),
            remote_data: None,
            winner: None,
            strategy: "manual".into(),
            reason: "test".into(),
            status: ConflictStatus::Pending,
            resolved_by: None,
            resolved_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_list_and_close() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.conflicts();
        let mut conn = db.pool().acquire().await.unwrap();
        repo.insert_in(&mut conn, &conflict("c1")).await.unwrap();
        drop(conn);

        let pending = repo.list(ConflictStatus::Pending, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].local_data, Some(json!({"name": "A"})));
        assert_eq!(pending[0].remote_version.instance_id, "nodeB");

        let mut conn = db.pool().acquire().await.unwrap();
        assert!(repo
            .close_in(&mut conn, "c1", ConflictStatus::Resolved, Some("remote"), "operator")
            .await
            .unwrap());
        assert!(!repo
            .close_in(&mut conn, "c1", ConflictStatus::Resolved, Some("local"), "operator")
            .await
            .unwrap());
        drop(conn);

        let closed = repo.get("c1").await.unwrap();
        assert_eq!(closed.status, ConflictStatus::Resolved);
        assert_eq!(closed.winner.as_deref(), Some("remote"));
        assert_eq!(repo.count_pending().await.unwrap(), 0);
        assert!(repo.get("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_carried_by_matches_branch_version() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.conflicts();

        let mut auto = conflict("auto");
        auto.status = ConflictStatus::Resolved;
        auto.resolved_by = Some("auto:nodeA".into());
        let mut manual = conflict("manual");
        manual.status = ConflictStatus::Resolved;
        manual.resolved_by = Some("operator".into());

        let mut conn = db.pool().acquire().await.unwrap();
        repo.insert_in(&mut conn, &auto).await.unwrap();
        repo.insert_in(&mut conn, &manual).await.unwrap();
        repo.insert_in(&mut conn, &conflict("pending")).await.unwrap();
        assert!(repo.exists_in(&mut conn, "auto").await.unwrap());
        assert!(!repo.exists_in(&mut conn, "other").await.unwrap());
        drop(conn);

        let branch = EntityMetadata::new(EntityType::Location, "Shelf A", "nodeB");
        let carried = repo.carried_by(&branch).await.unwrap();
        assert_eq!(carried.len(), 1);
        assert_eq!(carried[0].id, "auto");

        let mut unrelated = branch.clone();
        unrelated.version = 7;
        assert!(repo.carried_by(&unrelated).await.unwrap().is_empty());
    }
}
