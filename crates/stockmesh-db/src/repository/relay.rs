//! Envelopes held by a blind relay, keyed by recipient.
//!
//! Only ids, sizes and routing fields are ever logged here.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use stockmesh_core::EncryptedPacket;

use super::{from_micros, opt_from_micros, parse_column, to_micros};
use crate::error::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct PacketRow {
    id: String,
    sender_id: String,
    recipient_id: String,
    entity_type: String,
    entity_id: String,
    version: i64,
    nonce: String,
    ciphertext: String,
    created_at: i64,
    expires_at: i64,
    forwarded_at: Option<i64>,
}

impl TryFrom<PacketRow> for EncryptedPacket {
    type Error = DbError;

    fn try_from(row: PacketRow) -> DbResult<Self> {
        Ok(EncryptedPacket {
            id: row.id,
            sender_id: row.sender_id,
            recipient_id: row.recipient_id,
            entity_type: parse_column("entity_type", &row.entity_type)?,
            entity_id: row.entity_id,
            version: row.version,
            nonce: row.nonce,
            ciphertext: row.ciphertext,
            created_at: from_micros("created_at", row.created_at)?,
            expires_at: from_micros("expires_at", row.expires_at)?,
            forwarded_at: opt_from_micros("forwarded_at", row.forwarded_at)?,
        })
    }
}

/// Repository for `encrypted_sync_packets`.
#[derive(Debug, Clone)]
pub struct RelayPacketRepository {
    pool: SqlitePool,
}

impl RelayPacketRepository {
    pub fn new(pool: SqlitePool) -> Self {
        RelayPacketRepository { pool }
    }

    /// Stores an envelope. The same sender re-sending an id replaces it; an
    /// id already held for another sender is refused.
    pub async fn insert(&self, packet: &EncryptedPacket) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO encrypted_sync_packets (
                id, sender_id, recipient_id, entity_type, entity_id, version,
                nonce, ciphertext, size_bytes, created_at, expires_at, forwarded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)
            ON CONFLICT (id) DO UPDATE SET
                nonce = excluded.nonce,
                ciphertext = excluded.ciphertext,
                size_bytes = excluded.size_bytes,
                expires_at = excluded.expires_at,
                forwarded_at = NULL
            WHERE encrypted_sync_packets.sender_id = excluded.sender_id
              AND encrypted_sync_packets.recipient_id = excluded.recipient_id
            "#,
        )
        .bind(&packet.id)
        .bind(&packet.sender_id)
        .bind(&packet.recipient_id)
        .bind(packet.entity_type.as_str())
        .bind(&packet.entity_id)
        .bind(packet.version)
        .bind(&packet.nonce)
        .bind(&packet.ciphertext)
        .bind(packet.ciphertext.len() as i64)
        .bind(to_micros(packet.created_at))
        .bind(to_micros(packet.expires_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::UniqueViolation {
                field: "packet id".into(),
                value: packet.id.clone(),
            });
        }

        debug!(
            packet_id = %packet.id,
            recipient = %packet.recipient_id,
            size = packet.ciphertext.len(),
            "Relay packet stored"
        );
        Ok(())
    }

    /// Unexpired envelopes for `recipient`, oldest first, stamped as forwarded.
    pub async fn fetch_for(&self, recipient_id: &str, limit: i64, now: DateTime<Utc>) -> DbResult<Vec<EncryptedPacket>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<PacketRow> = sqlx::query_as(
            r#"
            SELECT id, sender_id, recipient_id, entity_type, entity_id, version,
                   nonce, ciphertext, created_at, expires_at, forwarded_at
            FROM encrypted_sync_packets
            WHERE recipient_id = ?1 AND expires_at > ?2
            ORDER BY created_at, id
            LIMIT ?3
            "#,
        )
        .bind(recipient_id)
        .bind(to_micros(now))
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        for row in &rows {
            sqlx::query("UPDATE encrypted_sync_packets SET forwarded_at = ?2 WHERE id = ?1")
                .bind(&row.id)
                .bind(to_micros(now))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        rows.into_iter()
            .map(|r| {
                let mut p = EncryptedPacket::try_from(r)?;
                p.forwarded_at = Some(now);
                Ok(p)
            })
            .collect()
    }

    /// Deletes acknowledged envelopes. Only the recipient may ack its own.
    pub async fn ack(&self, recipient_id: &str, ids: &[String]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM encrypted_sync_packets WHERE id = ?1 AND recipient_id = ?2")
                .bind(id)
                .bind(recipient_id)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM encrypted_sync_packets WHERE expires_at <= ?1")
            .bind(to_micros(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_for(&self, recipient_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM encrypted_sync_packets WHERE recipient_id = ?1")
            .bind(recipient_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::Duration;
    use stockmesh_core::EntityType;

    fn packet(id: &str, recipient: &str, ttl: Duration) -> EncryptedPacket {
        let now = Utc::now();
        EncryptedPacket {
            id: id.into(),
            sender_id: "nodeA".into(),
            recipient_id: recipient.into(),
            entity_type: EntityType::Tracking,
            entity_id: "TEST-1".into(),
            version: 1,
            nonce: "bm9uY2U=".into(),
            ciphertext: "Y2lwaGVy".into(),
            created_at: now,
            expires_at: now + ttl,
            forwarded_at: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_ack_and_purge() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.relay_packets();
        repo.insert(&packet("p1", "nodeB", Duration::hours(1))).await.unwrap();
        repo.insert(&packet("p2", "nodeC", Duration::hours(1))).await.unwrap();
        repo.insert(&packet("p3", "nodeB", Duration::seconds(-1))).await.unwrap();

        let fetched = repo.fetch_for("nodeB", 10, Utc::now()).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, "p1");
        assert!(fetched[0].forwarded_at.is_some());

        assert_eq!(repo.ack("nodeC", &["p1".to_string()]).await.unwrap(), 0);
        assert_eq!(repo.ack("nodeB", &["p1".to_string()]).await.unwrap(), 1);

        assert_eq!(repo.purge_expired(Utc::now()).await.unwrap(), 1);
        assert_eq!(repo.count_for("nodeB").await.unwrap(), 0);
        assert_eq!(repo.count_for("nodeC").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reused_id_from_other_sender_is_refused() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.relay_packets();
        repo.insert(&packet("p1", "nodeB", Duration::hours(1))).await.unwrap();

        // Same sender may replace its own envelope.
        let mut resent = packet("p1", "nodeB", Duration::hours(1));
        resent.ciphertext = "bmV3ZXI=".into();
        repo.insert(&resent).await.unwrap();

        let mut hijack = packet("p1", "nodeB", Duration::hours(1));
        hijack.sender_id = "nodeC".into();
        hijack.ciphertext = "ZXZpbA==".into();
        assert!(matches!(
            repo.insert(&hijack).await,
            Err(DbError::UniqueViolation { .. })
        ));

        let fetched = repo.fetch_for("nodeB", 10, Utc::now()).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].sender_id, "nodeA");
        assert_eq!(fetched[0].ciphertext, "bmV3ZXI=");
    }
}
