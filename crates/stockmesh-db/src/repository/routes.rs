//! Route health persisted across restarts.

use chrono::Utc;
use sqlx::SqlitePool;

use stockmesh_core::RouteRecord;

use super::{from_micros, opt_from_micros, parse_column, to_micros};
use crate::error::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct RouteRow {
    id: String,
    url: String,
    route_type: String,
    priority: i32,
    timeout_secs: i64,
    status: String,
    success_count: i64,
    failure_count: i64,
    consecutive_failures: i64,
    avg_latency_ms: f64,
    last_success_at: Option<i64>,
    last_failure_at: Option<i64>,
    last_error: Option<String>,
    updated_at: i64,
}

impl TryFrom<RouteRow> for RouteRecord {
    type Error = DbError;

    fn try_from(row: RouteRow) -> DbResult<Self> {
        Ok(RouteRecord {
            id: row.id,
            url: row.url,
            route_type: parse_column("route_type", &row.route_type)?,
            priority: row.priority,
            timeout_secs: row.timeout_secs.max(0) as u64,
            status: row.status,
            success_count: row.success_count,
            failure_count: row.failure_count,
            consecutive_failures: row.consecutive_failures,
            avg_latency_ms: row.avg_latency_ms,
            last_success_at: opt_from_micros("last_success_at", row.last_success_at)?,
            last_failure_at: opt_from_micros("last_failure_at", row.last_failure_at)?,
            last_error: row.last_error,
            updated_at: from_micros("updated_at", row.updated_at)?,
        })
    }
}

/// Repository for `sync_routes`.
#[derive(Debug, Clone)]
pub struct RouteRepository {
    pool: SqlitePool,
}

impl RouteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        RouteRepository { pool }
    }

    /// Saves the full route snapshot.
    pub async fn upsert(&self, route: &RouteRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_routes (
                id, url, route_type, priority, timeout_secs, status, success_count,
                failure_count, consecutive_failures, avg_latency_ms, last_success_at,
                last_failure_at, last_error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT (id) DO UPDATE SET
                url = excluded.url,
                route_type = excluded.route_type,
                priority = excluded.priority,
                timeout_secs = excluded.timeout_secs,
                status = excluded.status,
                success_count = excluded.success_count,
                failure_count = excluded.failure_count,
                consecutive_failures = excluded.consecutive_failures,
                avg_latency_ms = excluded.avg_latency_ms,
                last_success_at = excluded.last_success_at,
                last_failure_at = excluded.last_failure_at,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&route.id)
        .bind(&route.url)
        .bind(route.route_type.as_str())
        .bind(route.priority)
        .bind(route.timeout_secs as i64)
        .bind(&route.status)
        .bind(route.success_count)
        .bind(route.failure_count)
        .bind(route.consecutive_failures)
        .bind(route.avg_latency_ms)
        .bind(route.last_success_at.map(to_micros))
        .bind(route.last_failure_at.map(to_micros))
        .bind(&route.last_error)
        .bind(to_micros(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<RouteRecord>> {
        let row: Option<RouteRow> = sqlx::query_as("SELECT * FROM sync_routes WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RouteRecord::try_from).transpose()
    }

    /// All routes by priority.
    pub async fn list(&self) -> DbResult<Vec<RouteRecord>> {
        let rows: Vec<RouteRow> = sqlx::query_as("SELECT * FROM sync_routes ORDER BY priority, id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RouteRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use stockmesh_core::RouteType;

    #[tokio::test]
    async fn test_route_snapshot_roundtrip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut route = RouteRecord {
            id: "primary-1".into(),
            url: "http://10.0.0.2:8080".into(),
            route_type: RouteType::Primary,
            priority: 1,
            timeout_secs: 10,
            status: "idle".into(),
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            avg_latency_ms: 0.0,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            updated_at: Utc::now(),
        };
        db.routes().upsert(&route).await.unwrap();
        route.status = "degraded".into();
        route.failure_count = 3;
        db.routes().upsert(&route).await.unwrap();

        let all = db.routes().list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, "degraded");
        assert_eq!(all[0].failure_count, 3);
        assert_eq!(all[0].route_type, RouteType::Primary);
    }
}
