//! # Inbound Applier
//!
//! Applies versions received from peers (pull responses, pushes, relay
//! envelopes) to the local store.
//!
//! ## Apply Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    One Remote Record, One Transaction                   │
//! │                                                                         │
//! │  entity lock ──► BEGIN                                                 │
//! │                   │                                                     │
//! │                   ├─ no local metadata ─────────► write as-is          │
//! │                   │                                                     │
//! │                   └─ ConflictResolver::resolve(local, remote)          │
//! │                        ├─ NoOp               nothing                   │
//! │                        ├─ KeepLocal          merge clock, keep data    │
//! │                        ├─ ApplyRemote        write remote, merged clock│
//! │                        ├─ Manual             pending conflict          │
//! │                        └─ IntegrityViolation pending conflict, error   │
//! │                   │                                                     │
//! │                   ├─ losing side kept in sync_conflicts                │
//! │                   ├─ watermark advanced (pull only)                    │
//! │                 COMMIT                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failed record rolls back alone. Later records of the same batch are
//! still applied, but the watermark stops at the last record before the
//! failure so the next cycle asks for it again.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use stockmesh_core::{
    ConflictKind, ConflictResolver, ConflictStatus, EntityMetadata, EntityType, Resolution,
    ResolutionOutcome, SyncConflict, Winner, WriteOp,
};
use stockmesh_db::{Database, SqliteConnection};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::interceptor::{WriteContext, WriteHook, WriteInterceptor};
use crate::protocol::{ApplyStatus, ConflictChoice, WireRecord};

/// Where a batch of remote records came from.
#[derive(Debug, Clone)]
pub struct Origin {
    /// Instance id of the sending peer.
    pub peer: String,
    /// Route whose watermark the records advance. `None` for pushes.
    pub route_id: Option<String>,
}

impl Origin {
    pub fn pull(peer: impl Into<String>, route_id: impl Into<String>) -> Self {
        Origin {
            peer: peer.into(),
            route_id: Some(route_id.into()),
        }
    }

    pub fn push(peer: impl Into<String>) -> Self {
        Origin {
            peer: peer.into(),
            route_id: None,
        }
    }
}

/// Result of applying one record.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub status: ApplyStatus,
    pub reason: String,
    /// Local version after the apply.
    pub version: i64,
    pub conflict_id: Option<String>,
}

/// Totals for one applied batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub applied: usize,
    pub kept_local: usize,
    pub unchanged: usize,
    pub pending: usize,
    pub integrity_violations: usize,
    pub failed: usize,
    pub conflicts_detected: usize,
    pub last_error: Option<String>,
    /// Highest watermark committed for this batch.
    pub watermark: Option<DateTime<Utc>>,
    /// Ids where the local version won. The sender is behind on these.
    pub kept_local_ids: Vec<String>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.applied + self.kept_local + self.unchanged + self.pending + self.integrity_violations
    }

    fn count(&mut self, entity_id: &str, outcome: &ApplyOutcome, conflicted: bool) {
        match outcome.status {
            ApplyStatus::Applied => self.applied += 1,
            ApplyStatus::KeptLocal => {
                self.kept_local += 1;
                self.kept_local_ids.push(entity_id.to_string());
            }
            ApplyStatus::Unchanged => self.unchanged += 1,
            ApplyStatus::Pending => self.pending += 1,
            ApplyStatus::IntegrityViolation => self.integrity_violations += 1,
        }
        if conflicted {
            self.conflicts_detected += 1;
        }
    }
}

// =============================================================================
// Inbound Applier
// =============================================================================

pub struct InboundApplier {
    db: Arc<Database>,
    config: Arc<SyncConfig>,
    interceptor: Arc<WriteInterceptor>,
    resolver: ConflictResolver,
}

impl InboundApplier {
    pub fn new(db: Arc<Database>, config: Arc<SyncConfig>, interceptor: Arc<WriteInterceptor>) -> Self {
        let resolver = ConflictResolver::new(config.conflict_resolution, config.role);
        InboundApplier {
            db,
            config,
            interceptor,
            resolver,
        }
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Applies one remote record. Advances the origin route's watermark to
    /// the record's `modified_at` in the same transaction.
    pub async fn apply_remote(
        &self,
        entity_type: EntityType,
        record: WireRecord,
        origin: &Origin,
    ) -> SyncResult<ApplyOutcome> {
        let watermark = origin.route_id.as_ref().map(|_| record.metadata.modified_at);
        self.apply_one(entity_type, record, origin, watermark).await.map(|(o, _)| o)
    }

    /// Applies a batch, parents before children.
    ///
    /// The watermark only moves to the end of the longest prefix (in the
    /// sender's order) whose records are all applied.
    pub async fn apply_batch(
        &self,
        entity_type: EntityType,
        records: Vec<WireRecord>,
        origin: &Origin,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let sent_order: Vec<(String, DateTime<Utc>)> = records
            .iter()
            .map(|r| (r.entity_id.clone(), r.metadata.modified_at))
            .collect();
        let position: HashMap<String, usize> = sent_order
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (id.clone(), i))
            .collect();

        let mut done = vec![false; sent_order.len()];
        let mut prefix = 0usize;
        let mut failed = false;

        for record in parents_first(records) {
            let idx = position.get(&record.entity_id).copied();
            let entity_id = record.entity_id.clone();

            // Watermark this record would allow if it commits.
            let watermark = match (idx, &origin.route_id, failed) {
                (Some(i), Some(_), false) => {
                    done[i] = true;
                    let mut p = prefix;
                    while p < done.len() && done[p] {
                        p += 1;
                    }
                    done[i] = false;
                    (p > prefix).then(|| sent_order[p - 1].1)
                }
                _ => None,
            };

            match self.apply_one(entity_type, record, origin, watermark).await {
                Ok((outcome, conflicted)) => {
                    report.count(&entity_id, &outcome, conflicted);
                    if let Some(i) = idx {
                        done[i] = true;
                        while prefix < done.len() && done[prefix] {
                            prefix += 1;
                        }
                    }
                    if watermark.is_some() {
                        report.watermark = watermark;
                    }
                }
                Err(e) => {
                    warn!(
                        entity_type = %entity_type,
                        entity_id = %entity_id,
                        peer = %origin.peer,
                        error = %e,
                        "Failed to apply remote record"
                    );
                    report.failed += 1;
                    report.last_error = Some(e.to_string());
                    failed = true;
                }
            }
        }

        debug!(
            entity_type = %entity_type,
            peer = %origin.peer,
            applied = report.applied,
            kept = report.kept_local,
            unchanged = report.unchanged,
            failed = report.failed,
            "Batch applied"
        );
        report
    }

    async fn apply_one(
        &self,
        entity_type: EntityType,
        record: WireRecord,
        origin: &Origin,
        watermark: Option<DateTime<Utc>>,
    ) -> SyncResult<(ApplyOutcome, bool)> {
        if record.metadata.entity_type != entity_type || record.metadata.entity_id != record.entity_id {
            return Err(SyncError::BadRequest(format!(
                "record {} carries metadata for {}/{}",
                record.entity_id, record.metadata.entity_type, record.metadata.entity_id
            )));
        }

        let _guard = self.interceptor.locks().lock(entity_type, &record.entity_id).await;
        let mut tx = self.db.begin().await?;

        let local = self
            .db
            .metadata()
            .get_in(&mut tx, entity_type, &record.entity_id)
            .await?;

        let (outcome, conflicted) = match local {
            None => {
                let meta = self.write_remote_in(&mut tx, entity_type, &record, record.metadata.clone()).await?;
                let outcome = ApplyOutcome {
                    status: ApplyStatus::Applied,
                    reason: "new entity".into(),
                    version: meta.version,
                    conflict_id: None,
                };
                (outcome, false)
            }
            Some(local) => {
                let local_version = local.version_id();
                let resolution = self.resolver.resolve(&local, &record.metadata);
                let conflicted = resolution.conflict.is_some();
                let outcome = self
                    .apply_resolution_in(&mut tx, entity_type, local, &record, resolution, origin)
                    .await?;
                self.retain_carried_in(&mut tx, &local_version, &record, origin).await?;
                (outcome, conflicted)
            }
        };

        if let (Some(route_id), Some(ts)) = (&origin.route_id, watermark) {
            self.db
                .watermarks()
                .advance_in(&mut tx, route_id, entity_type, ts)
                .await?;
        }

        tx.commit().await?;
        Ok((outcome, conflicted))
    }

    async fn apply_resolution_in(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        mut local: EntityMetadata,
        record: &WireRecord,
        resolution: Resolution,
        origin: &Origin,
    ) -> SyncResult<ApplyOutcome> {
        let remote = &record.metadata;

        match resolution.outcome {
            ResolutionOutcome::NoOp => Ok(ApplyOutcome {
                status: ApplyStatus::Unchanged,
                reason: resolution.reason,
                version: local.version,
                conflict_id: None,
            }),

            ResolutionOutcome::KeepLocal => {
                let mut conflict_id = None;
                if resolution.merge_clock && resolution.merged_clock != local.vector_clock {
                    local.vector_clock = resolution.merged_clock.clone();
                    local.modified_at = Utc::now();
                    self.db.metadata().upsert_in(conn, &local).await?;
                }
                if resolution.retain_loser {
                    let local_data = self.local_data_in(conn, entity_type, &record.entity_id).await?;
                    let conflict = self.conflict_record(
                        &local,
                        remote,
                        local_data,
                        record.data.clone(),
                        &resolution,
                        ConflictStatus::Resolved,
                    );
                    self.db.conflicts().insert_in(conn, &conflict).await?;
                    conflict_id = Some(conflict.id);
                }
                debug!(
                    entity_type = %entity_type,
                    entity_id = %record.entity_id,
                    peer = %origin.peer,
                    reason = %resolution.reason,
                    "Kept local version"
                );
                Ok(ApplyOutcome {
                    status: ApplyStatus::KeptLocal,
                    reason: resolution.reason,
                    version: local.version,
                    conflict_id,
                })
            }

            ResolutionOutcome::ApplyRemote => {
                let mut conflict_id = None;
                if resolution.retain_loser {
                    let local_data = self.local_data_in(conn, entity_type, &record.entity_id).await?;
                    let conflict = self.conflict_record(
                        &local,
                        remote,
                        local_data,
                        record.data.clone(),
                        &resolution,
                        ConflictStatus::Resolved,
                    );
                    self.db.conflicts().insert_in(conn, &conflict).await?;
                    conflict_id = Some(conflict.id);
                }

                let mut incoming = remote.clone();
                if resolution.merge_clock {
                    incoming.vector_clock = resolution.merged_clock.clone();
                }
                let meta = self.write_remote_in(conn, entity_type, record, incoming).await?;

                if let Some(kind) = resolution.conflict {
                    info!(
                        entity_type = %entity_type,
                        entity_id = %record.entity_id,
                        kind = kind.as_str(),
                        reason = %resolution.reason,
                        "Conflict resolved in favour of remote"
                    );
                }
                Ok(ApplyOutcome {
                    status: ApplyStatus::Applied,
                    reason: resolution.reason,
                    version: meta.version,
                    conflict_id,
                })
            }

            ResolutionOutcome::Manual | ResolutionOutcome::IntegrityViolation => {
                let integrity = resolution.outcome == ResolutionOutcome::IntegrityViolation;
                if integrity {
                    error!(
                        entity_type = %entity_type,
                        entity_id = %record.entity_id,
                        peer = %origin.peer,
                        reason = %resolution.reason,
                        "Integrity violation: equal clocks with different content"
                    );
                }

                let already_pending = local.conflict_with.contains(&remote.version_id());

                let mut conflict_id = None;
                if !already_pending {
                    let local_data = self.local_data_in(conn, entity_type, &record.entity_id).await?;
                    let conflict = self.conflict_record(
                        &local,
                        remote,
                        local_data,
                        record.data.clone(),
                        &resolution,
                        ConflictStatus::Pending,
                    );
                    self.db.conflicts().insert_in(conn, &conflict).await?;
                    conflict_id = Some(conflict.id);

                    local.mark_conflict(remote.version_id());
                    self.db.metadata().upsert_in(conn, &local).await?;
                }

                Ok(ApplyOutcome {
                    status: if integrity {
                        ApplyStatus::IntegrityViolation
                    } else {
                        ApplyStatus::Pending
                    },
                    reason: resolution.reason,
                    version: local.version,
                    conflict_id,
                })
            }
        }
    }

    /// Keeps the peer's automatically resolved artifacts in which our
    /// pre-apply version was one of the branches, seen from our side.
    async fn retain_carried_in(
        &self,
        conn: &mut SqliteConnection,
        local_version: &str,
        record: &WireRecord,
        origin: &Origin,
    ) -> SyncResult<usize> {
        let mut retained = 0;
        for artifact in &record.artifacts {
            if artifact.entity_type != record.metadata.entity_type
                || artifact.entity_id != record.entity_id
                || artifact.status != ConflictStatus::Resolved
                || !artifact.involves(local_version)
            {
                continue;
            }
            if self.db.conflicts().exists_in(conn, &artifact.id).await? {
                continue;
            }
            self.db.conflicts().insert_in(conn, &artifact.mirrored()).await?;
            retained += 1;
            info!(
                conflict_id = %artifact.id,
                entity_type = %artifact.entity_type,
                entity_id = %artifact.entity_id,
                peer = %origin.peer,
                "Retained conflict artifact resolved by peer"
            );
        }
        Ok(retained)
    }

    async fn write_remote_in(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        record: &WireRecord,
        incoming: EntityMetadata,
    ) -> SyncResult<EntityMetadata> {
        let op = if incoming.deleted {
            WriteOp::Delete
        } else {
            WriteOp::Update
        };
        let ctx = WriteContext::inbound(incoming);
        let data = if op == WriteOp::Delete { None } else { record.data.as_ref() };

        self.interceptor
            .before_write(entity_type, &record.entity_id, op, data, &ctx)
            .await?;
        self.interceptor
            .store_record_in(conn, entity_type, &record.entity_id, op, data)
            .await?;
        self.interceptor
            .track_in(conn, entity_type, &record.entity_id, op, data, &ctx)
            .await
    }

    async fn local_data_in(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        entity_id: &str,
    ) -> SyncResult<Option<Value>> {
        Ok(self
            .db
            .records()
            .get_in(conn, entity_type, entity_id)
            .await?
            .map(|r| r.data))
    }

    fn conflict_record(
        &self,
        local: &EntityMetadata,
        remote: &EntityMetadata,
        local_data: Option<Value>,
        remote_data: Option<Value>,
        resolution: &Resolution,
        status: ConflictStatus,
    ) -> SyncConflict {
        let now = Utc::now();
        let resolved = status != ConflictStatus::Pending;
        SyncConflict {
            id: Uuid::new_v4().to_string(),
            entity_type: local.entity_type,
            entity_id: local.entity_id.clone(),
            conflict_type: resolution
                .conflict
                .unwrap_or(ConflictKind::ConcurrentUpdate)
                .as_str()
                .to_string(),
            local_version: local.clone(),
            remote_version: remote.clone(),
            local_data,
            remote_data,
            winner: resolution.winner.map(|w| w.as_str().to_string()),
            strategy: resolution.strategy.as_str().to_string(),
            reason: resolution.reason.clone(),
            status,
            resolved_by: resolved.then(|| format!("auto:{}", self.config.instance_id())),
            resolved_at: resolved.then_some(now),
            created_at: now,
        }
    }

    // =========================================================================
    // Manual Resolution
    // =========================================================================

    /// Closes a pending conflict by picking a side.
    ///
    /// The chosen data is written as a new local version whose clock
    /// dominates both branches, so every peer converges on it.
    pub async fn resolve_manually(
        &self,
        conflict_id: &str,
        choice: ConflictChoice,
        resolved_by: &str,
    ) -> SyncResult<EntityMetadata> {
        let conflict = self.db.conflicts().get(conflict_id).await?;
        if conflict.status != ConflictStatus::Pending {
            return Err(SyncError::BadRequest(format!(
                "conflict {} is already {}",
                conflict_id, conflict.status
            )));
        }

        let entity_type = conflict.entity_type;
        let entity_id = conflict.entity_id.clone();
        let (chosen_meta, chosen_data, winner) = match choice {
            ConflictChoice::Local => (&conflict.local_version, conflict.local_data.clone(), Winner::Local),
            ConflictChoice::Remote => (&conflict.remote_version, conflict.remote_data.clone(), Winner::Remote),
        };
        let op = if chosen_meta.deleted || chosen_data.is_none() {
            WriteOp::Delete
        } else {
            WriteOp::Update
        };

        let _guard = self.interceptor.locks().lock(entity_type, &entity_id).await;
        let mut tx = self.db.begin().await?;

        let mut current = self
            .db
            .metadata()
            .get_in(&mut tx, entity_type, &entity_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("{}/{}", entity_type, entity_id)))?;
        current.vector_clock.merge(&conflict.local_version.vector_clock);
        current.vector_clock.merge(&conflict.remote_version.vector_clock);
        current.clear_conflict();
        self.db.metadata().upsert_in(&mut tx, &current).await?;

        let mut ctx = WriteContext::new(chosen_meta.source).with_user(resolved_by);
        if let Some(device) = chosen_meta.device_id.clone() {
            ctx = ctx.with_device(device);
        }
        self.interceptor
            .store_record_in(&mut tx, entity_type, &entity_id, op, chosen_data.as_ref())
            .await?;
        let meta = self
            .interceptor
            .track_in(&mut tx, entity_type, &entity_id, op, chosen_data.as_ref(), &ctx)
            .await?;

        self.db
            .conflicts()
            .close_in(&mut tx, conflict_id, ConflictStatus::Resolved, Some(winner.as_str()), resolved_by)
            .await?;
        tx.commit().await?;

        info!(
            conflict_id = %conflict_id,
            entity_type = %entity_type,
            entity_id = %entity_id,
            winner = winner.as_str(),
            resolved_by = %resolved_by,
            "Conflict resolved manually"
        );
        Ok(meta)
    }
}

/// Orders records so a parent of the same type precedes its children.
/// Otherwise the sender's order is kept.
fn parents_first(records: Vec<WireRecord>) -> Vec<WireRecord> {
    let parent_of: HashMap<String, String> = records
        .iter()
        .filter_map(|r| {
            let (t, pid) = r.metadata.parent()?;
            (t == r.metadata.entity_type).then(|| (r.entity_id.clone(), pid.to_string()))
        })
        .collect();

    let depth = |id: &str| {
        let mut seen = HashSet::new();
        let mut d = 0usize;
        let mut cur = id.to_string();
        while let Some(p) = parent_of.get(&cur) {
            if !seen.insert(cur.clone()) {
                break;
            }
            d += 1;
            cur = p.clone();
        }
        d
    };

    let mut keyed: Vec<(usize, WireRecord)> = records
        .into_iter()
        .map(|r| (depth(&r.entity_id), r))
        .collect();
    keyed.sort_by_key(|(d, _)| *d);
    keyed.into_iter().map(|(_, r)| r).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use chrono::TimeZone;
    use stockmesh_core::{ConflictStrategy, NodeRole, TruthSource, VectorClock};
    use stockmesh_db::DbConfig;

    struct Node {
        db: Arc<Database>,
        interceptor: Arc<WriteInterceptor>,
        applier: InboundApplier,
    }

    async fn node(id: &str, strategy: ConflictStrategy) -> Node {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let mut config = SyncConfig::default();
        config.node.instance_id = id.into();
        config.node.mesh_secret = "secret".into();
        config.role = NodeRole::Peer;
        config.conflict_resolution = strategy;
        let config = Arc::new(config);
        let interceptor = Arc::new(WriteInterceptor::new(db.clone(), config.clone()));
        let applier = InboundApplier::new(db.clone(), config, interceptor.clone());
        Node { db, interceptor, applier }
    }

    async fn export(node: &Node, t: EntityType, id: &str) -> WireRecord {
        let metadata = node.db.metadata().get(t, id).await.unwrap().unwrap();
        let data = node.db.records().get(t, id).await.unwrap().map(|r| r.data);
        let artifacts = node.db.conflicts().carried_by(&metadata).await.unwrap();
        WireRecord {
            entity_id: id.into(),
            data,
            metadata,
            artifacts,
        }
    }

    #[tokio::test]
    async fn test_new_record_applied_with_remote_clock() {
        let a = node("nodeA", ConflictStrategy::PriorityBased).await;
        let b = node("nodeB", ConflictStrategy::PriorityBased).await;

        a.interceptor
            .upsert(
                EntityType::Tracking,
                "TEST-1",
                &json!({"status": "in_transit"}),
                &WriteContext::new(TruthSource::Local),
            )
            .await
            .unwrap();
        let record = export(&a, EntityType::Tracking, "TEST-1").await;

        let outcome = b
            .applier
            .apply_remote(EntityType::Tracking, record, &Origin::pull("nodeA", "primary:a"))
            .await
            .unwrap();

        assert_eq!(outcome.status, ApplyStatus::Applied);
        let meta = b.db.metadata().get(EntityType::Tracking, "TEST-1").await.unwrap().unwrap();
        assert_eq!(meta.vector_clock, VectorClock::from([("nodeA", 1)]));
        assert_eq!(meta.source, TruthSource::Local);
        assert!(b.db.watermarks().since("primary:a", EntityType::Tracking).await.unwrap().is_some());
        assert_eq!(b.db.queue().count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let a = node("nodeA", ConflictStrategy::PriorityBased).await;
        let b = node("nodeB", ConflictStrategy::PriorityBased).await;
        a.interceptor
            .upsert(EntityType::Product, "P1", &json!({"name": "Bolt"}), &WriteContext::new(TruthSource::Local))
            .await
            .unwrap();
        let record = export(&a, EntityType::Product, "P1").await;
        let origin = Origin::push("nodeA");

        b.applier.apply_remote(EntityType::Product, record.clone(), &origin).await.unwrap();
        let first = b.db.metadata().get(EntityType::Product, "P1").await.unwrap().unwrap();

        let second = b.applier.apply_remote(EntityType::Product, record, &origin).await.unwrap();
        let after = b.db.metadata().get(EntityType::Product, "P1").await.unwrap().unwrap();

        assert_eq!(second.status, ApplyStatus::Unchanged);
        assert_eq!(first, after);
    }

    #[tokio::test]
    async fn test_stale_remote_keeps_local() {
        let a = node("nodeA", ConflictStrategy::PriorityBased).await;
        let ctx = WriteContext::new(TruthSource::Local);
        a.interceptor
            .upsert(EntityType::Product, "P1", &json!({"v": 1}), &ctx)
            .await
            .unwrap();
        let old = export(&a, EntityType::Product, "P1").await;
        a.interceptor
            .upsert(EntityType::Product, "P1", &json!({"v": 2}), &ctx)
            .await
            .unwrap();

        let outcome = a
            .applier
            .apply_remote(EntityType::Product, old, &Origin::push("nodeB"))
            .await
            .unwrap();
        assert_eq!(outcome.status, ApplyStatus::KeptLocal);
        let record = a.db.records().get(EntityType::Product, "P1").await.unwrap().unwrap();
        assert_eq!(record.data, json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_manual_policy_records_pending_conflict() {
        let a = node("nodeA", ConflictStrategy::Manual).await;
        let b = node("nodeB", ConflictStrategy::Manual).await;

        a.interceptor
            .upsert(EntityType::Location, "Shelf A", &json!({"usage": "internal"}), &WriteContext::new(TruthSource::Local))
            .await
            .unwrap();
        b.interceptor
            .upsert(EntityType::Location, "Shelf A", &json!({"usage": "view"}), &WriteContext::new(TruthSource::Local))
            .await
            .unwrap();

        let from_b = export(&b, EntityType::Location, "Shelf A").await;
        let before = a.db.metadata().get(EntityType::Location, "Shelf A").await.unwrap().unwrap();
        let outcome = a
            .applier
            .apply_remote(EntityType::Location, from_b, &Origin::push("nodeB"))
            .await
            .unwrap();

        assert_eq!(outcome.status, ApplyStatus::Pending);
        let after = a.db.metadata().get(EntityType::Location, "Shelf A").await.unwrap().unwrap();
        assert!(after.has_conflict);
        assert_eq!(after.vector_clock, before.vector_clock);
        assert_eq!(a.db.conflicts().count_pending().await.unwrap(), 1);

        let resolved = a
            .applier
            .resolve_manually(&outcome.conflict_id.unwrap(), ConflictChoice::Remote, "operator")
            .await
            .unwrap();
        assert!(!resolved.has_conflict);
        assert_eq!(resolved.vector_clock.get("nodeA"), 2);
        assert_eq!(resolved.vector_clock.get("nodeB"), 1);
        let record = a.db.records().get(EntityType::Location, "Shelf A").await.unwrap().unwrap();
        assert_eq!(record.data, json!({"usage": "view"}));
        assert_eq!(a.db.conflicts().count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_applies_parents_first() {
        let a = node("nodeA", ConflictStrategy::PriorityBased).await;
        let b = node("nodeB", ConflictStrategy::PriorityBased).await;
        let ctx = WriteContext::new(TruthSource::Local);

        a.interceptor
            .upsert(EntityType::Location, "WH", &json!({"name": "Main"}), &ctx)
            .await
            .unwrap();
        a.interceptor
            .upsert(
                EntityType::Location,
                "Shelf A",
                &json!({"usage": "internal"}),
                &ctx.clone().with_parent(EntityType::Location, "WH"),
            )
            .await
            .unwrap();

        let child = export(&a, EntityType::Location, "Shelf A").await;
        let parent = export(&a, EntityType::Location, "WH").await;

        let report = b
            .applier
            .apply_batch(EntityType::Location, vec![child, parent], &Origin::pull("nodeA", "r"))
            .await;
        assert_eq!(report.applied, 2);
        assert_eq!(report.failed, 0);

        let a_root = a.db.checksums().get(EntityType::Location, "WH").await.unwrap().unwrap();
        let b_root = b.db.checksums().get(EntityType::Location, "WH").await.unwrap().unwrap();
        assert_eq!(a_root.entity.full_hash, b_root.entity.full_hash);
        assert_eq!(b_root.entity.child_count, 1);
    }

    #[tokio::test]
    async fn test_failed_record_holds_watermark_at_prefix() {
        let a = node("nodeA", ConflictStrategy::PriorityBased).await;
        let b = node("nodeB", ConflictStrategy::PriorityBased).await;
        let ctx = WriteContext::new(TruthSource::Local);

        let base = Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).unwrap();
        let mut batch = Vec::new();
        for (i, id) in ["T1", "T2", "T3"].into_iter().enumerate() {
            a.interceptor
                .upsert(EntityType::Tracking, id, &json!({"status": "packed"}), &ctx)
                .await
                .unwrap();
            let mut record = export(&a, EntityType::Tracking, id).await;
            record.metadata.modified_at = base + chrono::Duration::seconds(i as i64);
            batch.push(record);
        }
        // Metadata that belongs to another entity is refused.
        batch[1].metadata.entity_id = "T9".into();

        let report = b
            .applier
            .apply_batch(EntityType::Tracking, batch, &Origin::pull("nodeA", "r"))
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 2);
        assert_eq!(report.watermark, Some(base));
        assert_eq!(
            b.db.watermarks().since("r", EntityType::Tracking).await.unwrap(),
            Some(base)
        );
        assert!(b.db.records().get(EntityType::Tracking, "T3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resolved_conflict_travels_to_the_losing_side() {
        let a = node("nodeA", ConflictStrategy::PriorityBased).await;
        let b = node("nodeB", ConflictStrategy::PriorityBased).await;

        a.interceptor
            .upsert(EntityType::Location, "Shelf A", &json!({"usage": 30}), &WriteContext::new(TruthSource::Physical))
            .await
            .unwrap();
        b.interceptor
            .upsert(EntityType::Location, "Shelf A", &json!({"usage": 25}), &WriteContext::new(TruthSource::Local))
            .await
            .unwrap();

        // B pulls the scan and loses its desk edit.
        let from_a = export(&a, EntityType::Location, "Shelf A").await;
        b.applier
            .apply_remote(EntityType::Location, from_a, &Origin::pull("nodeA", "r"))
            .await
            .unwrap();
        let on_b = b.db.conflicts().for_entity(EntityType::Location, "Shelf A").await.unwrap();
        assert_eq!(on_b.len(), 1);

        // A receives the merged version together with the artifact.
        let from_b = export(&b, EntityType::Location, "Shelf A").await;
        assert_eq!(from_b.artifacts.len(), 1);
        a.applier
            .apply_remote(EntityType::Location, from_b.clone(), &Origin::push("nodeB"))
            .await
            .unwrap();
        a.applier
            .apply_remote(EntityType::Location, from_b, &Origin::push("nodeB"))
            .await
            .unwrap();

        let on_a = a.db.conflicts().for_entity(EntityType::Location, "Shelf A").await.unwrap();
        assert_eq!(on_a.len(), 1);
        assert_eq!(on_a[0].id, on_b[0].id);
        assert_eq!(on_a[0].status, ConflictStatus::Resolved);
        assert_eq!(on_a[0].local_data.as_ref().unwrap()["usage"], 30);
        assert_eq!(on_a[0].remote_data.as_ref().unwrap()["usage"], 25);
        assert_eq!(on_a[0].winner.as_deref(), Some("local"));
    }

    #[test]
    fn test_parents_first_keeps_unrelated_order() {
        let mk = |id: &str, parent: Option<&str>| {
            let mut m = EntityMetadata::new(EntityType::Location, id, "nodeA");
            m.set_parent(parent.map(|p| (EntityType::Location, p.to_string())));
            WireRecord {
                entity_id: id.into(),
                data: Some(json!({})),
                metadata: m,
                artifacts: Vec::new(),
            }
        };
        let ordered = parents_first(vec![mk("c", Some("b")), mk("x", None), mk("b", Some("a")), mk("a", None)]);
        let ids: Vec<&str> = ordered.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["x", "a", "b", "c"]);
    }
}
