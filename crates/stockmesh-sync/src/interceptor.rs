//! # Write Interceptor
//!
//! Every create, update or delete of a synchronized entity passes through
//! here, whether it came from a local caller or from a peer.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         One Entity Write                                │
//! │                                                                         │
//! │  storage adapter ──► before_write ──► (domain row written) ──►         │
//! │                      after_write                                        │
//! │                          │                                              │
//! │                          ▼   per-entity lock held, one transaction      │
//! │   ┌──────────────────────────────────────────────────────────────┐     │
//! │   │ 1. load or create EntityMetadata                             │     │
//! │   │ 2. local:   version += 1, clock[self] += 1, source from ctx  │     │
//! │   │    inbound: take the resolved remote metadata as is          │     │
//! │   │ 3. content hash, children hash, full hash                    │     │
//! │   │ 4. walk ancestors (≤ hierarchy_depth) re-hashing each        │     │
//! │   │ 5. local only: debounced sync_queue entry                    │     │
//! │   └──────────────────────────────────────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Inbound writes never enqueue. That is what stops a change bouncing
//! between two nodes forever.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use stockmesh_core::{
    ChecksumCalculator, ChecksumEntity, EntityMetadata, EntityType, TruthSource, WriteOp,
};
use stockmesh_db::{Database, Enqueue, SqliteConnection};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Write Context
// =============================================================================

/// Who is writing, and on whose behalf.
#[derive(Debug, Clone)]
pub struct WriteContext {
    pub source: TruthSource,
    pub device_id: Option<String>,
    pub user_id: Option<String>,
    /// Parent in the checksum tree. `None` keeps the current link.
    pub parent: Option<(EntityType, String)>,
    /// Set for writes that originate from sync.
    remote: Option<EntityMetadata>,
}

impl WriteContext {
    pub fn new(source: TruthSource) -> Self {
        WriteContext {
            source,
            device_id: None,
            user_id: None,
            parent: None,
            remote: None,
        }
    }

    /// A write applying an already-resolved remote version.
    pub fn inbound(remote_metadata: EntityMetadata) -> Self {
        WriteContext {
            source: remote_metadata.source,
            device_id: remote_metadata.device_id.clone(),
            user_id: remote_metadata.user_id.clone(),
            parent: remote_metadata
                .parent()
                .map(|(t, id)| (t, id.to_string())),
            remote: Some(remote_metadata),
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_parent(mut self, entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        self.parent = Some((entity_type, entity_id.into()));
        self
    }

    pub fn is_inbound(&self) -> bool {
        self.remote.is_some()
    }
}

// =============================================================================
// Hook Interface
// =============================================================================

/// Narrow interface every storage adapter calls around a domain write.
#[async_trait]
pub trait WriteHook: Send + Sync {
    /// Rejects writes that must not reach the domain table.
    async fn before_write(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        op: WriteOp,
        data: Option<&Value>,
        ctx: &WriteContext,
    ) -> SyncResult<()>;

    /// Updates metadata and checksums after the domain row was written.
    async fn after_write(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        op: WriteOp,
        data: Option<&Value>,
        ctx: &WriteContext,
    ) -> SyncResult<EntityMetadata>;
}

// =============================================================================
// Per-Entity Locks
// =============================================================================

const LOCK_STRIPES: usize = 64;

/// Striped async locks: two writes to the same entity never interleave.
pub struct EntityLocks {
    stripes: Vec<Mutex<()>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        EntityLocks {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub async fn lock(&self, entity_type: EntityType, entity_id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        entity_type.hash(&mut hasher);
        entity_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[idx].lock().await
    }
}

impl Default for EntityLocks {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Write Interceptor
// =============================================================================

pub struct WriteInterceptor {
    db: Arc<Database>,
    config: Arc<SyncConfig>,
    calculator: ChecksumCalculator,
    locks: EntityLocks,
}

impl WriteInterceptor {
    pub fn new(db: Arc<Database>, config: Arc<SyncConfig>) -> Self {
        let calculator = ChecksumCalculator::new(config.instance_id());
        WriteInterceptor {
            db,
            config,
            calculator,
            locks: EntityLocks::new(),
        }
    }

    pub fn calculator(&self) -> &ChecksumCalculator {
        &self.calculator
    }

    pub(crate) fn locks(&self) -> &EntityLocks {
        &self.locks
    }

    /// Writes the replicated payload and tracks it, atomically.
    ///
    /// This is the storage adapter for the `entity_records` table.
    pub async fn write(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        op: WriteOp,
        data: Option<&Value>,
        ctx: &WriteContext,
    ) -> SyncResult<EntityMetadata> {
        self.write_locked(entity_type, entity_id, Some(op), data, ctx).await
    }

    /// Creates or updates an entity from a local caller.
    ///
    /// Create versus update is decided under the entity lock, so two
    /// racing upserts of a new id yield one create and one update.
    pub async fn upsert(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        data: &Value,
        ctx: &WriteContext,
    ) -> SyncResult<EntityMetadata> {
        self.write_locked(entity_type, entity_id, None, Some(data), ctx).await
    }

    /// `op = None` classifies the write from the stored metadata.
    async fn write_locked(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        op: Option<WriteOp>,
        data: Option<&Value>,
        ctx: &WriteContext,
    ) -> SyncResult<EntityMetadata> {
        let _guard = self.locks.lock(entity_type, entity_id).await;
        let mut tx = self.db.begin().await?;

        let op = match op {
            Some(op) => op,
            None => match self.db.metadata().get_in(&mut tx, entity_type, entity_id).await? {
                Some(meta) if !meta.deleted => WriteOp::Update,
                _ => WriteOp::Create,
            },
        };
        self.before_write(entity_type, entity_id, op, data, ctx).await?;

        self.store_record_in(&mut tx, entity_type, entity_id, op, data).await?;
        let meta = self.track_in(&mut tx, entity_type, entity_id, op, data, ctx).await?;
        tx.commit().await?;

        Ok(meta)
    }

    pub async fn delete(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        ctx: &WriteContext,
    ) -> SyncResult<EntityMetadata> {
        self.write(entity_type, entity_id, WriteOp::Delete, None, ctx).await
    }

    pub(crate) async fn store_record_in(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        entity_id: &str,
        op: WriteOp,
        data: Option<&Value>,
    ) -> SyncResult<()> {
        let records = self.db.records();
        match (op, data) {
            (WriteOp::Delete, _) => {
                records.delete_in(conn, entity_type, entity_id).await?;
            }
            (_, Some(data)) => {
                records.upsert_in(conn, entity_type, entity_id, data).await?;
            }
            // metadata-only inbound write: payload untouched
            (_, None) => {}
        }
        Ok(())
    }

    /// Metadata, checksums, ancestors and queue for one write.
    ///
    /// The caller holds the entity lock and owns the transaction.
    pub(crate) async fn track_in(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        entity_id: &str,
        op: WriteOp,
        data: Option<&Value>,
        ctx: &WriteContext,
    ) -> SyncResult<EntityMetadata> {
        let metadata = self.db.metadata();
        let checksums = self.db.checksums();
        let instance_id = self.config.instance_id();

        let previous = metadata.get_in(conn, entity_type, entity_id).await?;
        let old_parent = previous
            .as_ref()
            .and_then(|m| m.parent().map(|(t, id)| (t, id.to_string())));

        let mut meta = match &ctx.remote {
            Some(remote) => {
                let mut m = remote.clone();
                m.synced_routes.clear();
                m
            }
            None => {
                let mut m = previous
                    .clone()
                    .unwrap_or_else(|| EntityMetadata::new(entity_type, entity_id, instance_id));
                m.increment_version(instance_id);
                m.set_source(ctx.source, ctx.device_id.clone());
                if ctx.user_id.is_some() {
                    m.user_id = ctx.user_id.clone();
                }
                if ctx.parent.is_some() {
                    m.set_parent(ctx.parent.clone());
                }
                m
            }
        };
        meta.modified_at = Utc::now();

        let node_hash = if op == WriteOp::Delete || meta.deleted {
            if op == WriteOp::Delete && !meta.deleted {
                meta.tombstone();
            }
            meta.content_hash = String::new();
            meta.hierarchy_hash = String::new();
            checksums.delete_in(conn, entity_type, entity_id).await?;
            None
        } else {
            meta.revive();
            let content_hash = match data {
                Some(data) => {
                    let hash = self.calculator.compute_content_hash(data);
                    if ctx.is_inbound() && hash != meta.content_hash {
                        warn!(
                            entity_type = %entity_type,
                            entity_id = %entity_id,
                            "Remote content hash does not match payload, using local hash"
                        );
                    }
                    hash
                }
                None => meta.content_hash.clone(),
            };

            let mut node = ChecksumEntity::new(entity_type, entity_id);
            node.source_instance = instance_id.to_string();
            node.set_content_hash(content_hash.clone());
            node.source_device = meta.device_id.clone();
            for child in metadata.children_of_in(conn, entity_type, entity_id).await? {
                node.add_child(child.entity_id, child.hierarchy_hash);
            }
            node.recompute();
            checksums.upsert_in(conn, &node, meta.parent()).await?;

            meta.content_hash = content_hash;
            meta.hierarchy_hash = node.full_hash.clone();
            Some(node.full_hash)
        };

        metadata.upsert_in(conn, &meta).await?;

        let new_parent = meta.parent().map(|(t, id)| (t, id.to_string()));
        if old_parent.is_some() && old_parent != new_parent {
            self.propagate_to_ancestors(conn, entity_id, None, old_parent).await?;
        }
        self.propagate_to_ancestors(conn, entity_id, node_hash.as_deref(), new_parent)
            .await?;

        if !ctx.is_inbound() {
            self.enqueue_in(conn, entity_type, entity_id, op).await?;
        }

        debug!(
            entity_type = %entity_type,
            entity_id = %entity_id,
            version = meta.version,
            clock = %meta.vector_clock,
            inbound = ctx.is_inbound(),
            "Entity write tracked"
        );
        Ok(meta)
    }

    /// Re-hashes up to `hierarchy_depth` ancestors after a child changed.
    ///
    /// `child_hash = None` removes the child from its parent.
    pub async fn propagate_to_ancestors(
        &self,
        conn: &mut SqliteConnection,
        child_id: &str,
        child_hash: Option<&str>,
        parent: Option<(EntityType, String)>,
    ) -> SyncResult<usize> {
        let checksums = self.db.checksums();
        let metadata = self.db.metadata();

        let mut child_id = child_id.to_string();
        let mut child_hash = child_hash.map(str::to_string);
        let mut next = parent;
        let mut touched = 0;

        for _ in 0..self.config.hierarchy_depth {
            let Some((parent_type, parent_id)) = next.take() else {
                break;
            };
            let Some(stored) = checksums.get_in(conn, parent_type, &parent_id).await? else {
                debug!(
                    parent_type = %parent_type,
                    parent_id = %parent_id,
                    "Parent not tracked yet, stopping ancestor walk"
                );
                break;
            };

            let mut node = stored.entity;
            match &child_hash {
                Some(hash) => node.add_child(child_id.clone(), hash.clone()),
                None => {
                    node.remove_child(&child_id);
                }
            }
            node.recompute();
            node.last_updated = Utc::now();
            let grandparent = stored.parent;
            checksums
                .upsert_in(
                    conn,
                    &node,
                    grandparent.as_ref().map(|(t, id)| (*t, id.as_str())),
                )
                .await?;

            if let Some(mut parent_meta) = metadata.get_in(conn, parent_type, &parent_id).await? {
                parent_meta.hierarchy_hash = node.full_hash.clone();
                metadata.upsert_in(conn, &parent_meta).await?;
            }

            touched += 1;
            child_id = parent_id;
            child_hash = Some(node.full_hash);
            next = grandparent;
        }

        Ok(touched)
    }

    async fn enqueue_in(
        &self,
        conn: &mut SqliteConnection,
        entity_type: EntityType,
        entity_id: &str,
        op: WriteOp,
    ) -> SyncResult<()> {
        let Some(entity) = self.config.entity(entity_type).filter(|e| e.enabled) else {
            return Ok(());
        };
        if !self.config.queues_event(op) || !self.config.direction.pushes() {
            return Ok(());
        }

        let entry = self
            .db
            .queue()
            .enqueue_in(
                conn,
                &Enqueue {
                    entity_type,
                    entity_id,
                    operation: op,
                    priority: entity.queue_priority(),
                    buffer: chrono::Duration::milliseconds(self.config.realtime.buffer_time_ms as i64),
                    max_retries: self.config.transport.max_retries as i32,
                },
            )
            .await?;
        debug!(queue_id = %entry.id, scheduled_at = %entry.scheduled_at, "Change queued");
        Ok(())
    }
}

#[async_trait]
impl WriteHook for WriteInterceptor {
    async fn before_write(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        op: WriteOp,
        data: Option<&Value>,
        ctx: &WriteContext,
    ) -> SyncResult<()> {
        if entity_id.trim().is_empty() {
            return Err(SyncError::BadRequest("entity id must not be empty".into()));
        }
        if let Some(remote) = &ctx.remote {
            if remote.entity_type != entity_type || remote.entity_id != entity_id {
                return Err(SyncError::BadRequest(format!(
                    "metadata for {}/{} attached to {}/{}",
                    remote.entity_type, remote.entity_id, entity_type, entity_id
                )));
            }
        }
        match (op, data) {
            (WriteOp::Delete, _) => Ok(()),
            (_, Some(Value::Object(_))) => Ok(()),
            (_, None) if ctx.is_inbound() => Ok(()),
            (_, _) => Err(SyncError::BadRequest(format!(
                "{} of {}/{} needs a JSON object payload",
                op, entity_type, entity_id
            ))),
        }
    }

    async fn after_write(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        op: WriteOp,
        data: Option<&Value>,
        ctx: &WriteContext,
    ) -> SyncResult<EntityMetadata> {
        let _guard = self.locks.lock(entity_type, entity_id).await;
        let mut tx = self.db.begin().await?;
        let meta = self.track_in(&mut tx, entity_type, entity_id, op, data, ctx).await?;
        tx.commit().await?;
        Ok(meta)
    }
}
