//! # Entity Metadata
//!
//! The durable sync record kept for every replicated entity instance.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     EntityMetadata Lifecycle                            │
//! │                                                                         │
//! │  first local write ──► new() + increment_version()                     │
//! │                           version = 1, clock = {self: 1}               │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  every local write ──► increment_version()                             │
//! │                           version += 1, clock[self] += 1               │
//! │                           hashes recomputed by the interceptor         │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  remote version applied ──► replaced by remote metadata,               │
//! │                             clock merged, source kept from origin      │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  delete ──► tombstone()                                                │
//! │             row kept with deleted = true until the retention window    │
//! │             expires, so peers learn about the delete                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Timestamps
//! - `updated_at` is set by the writer that produced the version and travels
//!   with it. It is advisory and only breaks ties.
//! - `modified_at` is when *this node* last changed the row (including
//!   applying a remote version). Pull queries and watermarks use it, so two
//!   nodes never compare each other's wall clocks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EntityType, SourcePriority, TruthSource};
use crate::vector_clock::VectorClock;

/// Sync bookkeeping for one entity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub entity_type: EntityType,
    /// Stable across nodes.
    pub entity_id: String,
    /// Incremented only by the writer that owns the change.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,

    pub source: TruthSource,
    pub source_priority: i32,
    /// Instance that produced the current version.
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default)]
    pub content_hash: String,
    /// Full hash of the checksum tree node (content plus descendants).
    #[serde(default)]
    pub hierarchy_hash: String,
    #[serde(default)]
    pub vector_clock: VectorClock,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_type: Option<EntityType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Route id → last instant this version was delivered there.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub synced_routes: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub sync_attempts: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_error: Option<String>,

    #[serde(default)]
    pub has_conflict: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflict_with: Vec<String>,

    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl EntityMetadata {
    /// Creates metadata for an entity that has not been written yet.
    ///
    /// Version 0 and an empty clock; the first `increment_version` call
    /// turns it into version 1.
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        let now = Utc::now();
        EntityMetadata {
            entity_type,
            entity_id: entity_id.into(),
            version: 0,
            updated_at: now,
            modified_at: now,
            source: TruthSource::Undefined,
            source_priority: SourcePriority::Undefined.value(),
            instance_id: instance_id.into(),
            device_id: None,
            user_id: None,
            content_hash: String::new(),
            hierarchy_hash: String::new(),
            vector_clock: VectorClock::new(),
            parent_type: None,
            parent_id: None,
            synced_routes: BTreeMap::new(),
            sync_attempts: 0,
            last_sync_error: None,
            has_conflict: false,
            conflict_with: Vec::new(),
            deleted: false,
            deleted_at: None,
        }
    }

    /// Records a local write by `instance_id`.
    pub fn increment_version(&mut self, instance_id: &str) {
        let now = Utc::now();
        self.version += 1;
        self.vector_clock.increment(instance_id);
        self.instance_id = instance_id.to_string();
        self.updated_at = now;
        self.modified_at = now;
        self.synced_routes.clear();
    }

    /// Sets the truth source and its fixed priority.
    pub fn set_source(&mut self, source: TruthSource, device_id: Option<String>) {
        self.source = source;
        self.source_priority = source.priority().value();
        if device_id.is_some() {
            self.device_id = device_id;
        }
    }

    pub fn priority(&self) -> SourcePriority {
        SourcePriority::from_value(self.source_priority)
    }

    /// Flags a conflict against another version id. Duplicate ids are ignored.
    pub fn mark_conflict(&mut self, conflict_with: impl Into<String>) {
        let id = conflict_with.into();
        self.has_conflict = true;
        if !self.conflict_with.contains(&id) {
            self.conflict_with.push(id);
        }
    }

    pub fn clear_conflict(&mut self) {
        self.has_conflict = false;
        self.conflict_with.clear();
    }

    /// Records a successful delivery to `route_id`.
    pub fn mark_synced(&mut self, route_id: &str) {
        self.synced_routes.insert(route_id.to_string(), Utc::now());
        self.sync_attempts = 0;
        self.last_sync_error = None;
    }

    pub fn record_sync_error(&mut self, error: impl Into<String>) {
        self.sync_attempts += 1;
        self.last_sync_error = Some(error.into());
    }

    /// Turns this row into a tombstone.
    pub fn tombstone(&mut self) {
        let now = Utc::now();
        self.deleted = true;
        self.deleted_at = Some(now);
    }

    /// Clears a tombstone when the entity is recreated.
    pub fn revive(&mut self) {
        self.deleted = false;
        self.deleted_at = None;
    }

    /// Sets the parent link used by the checksum tree.
    pub fn set_parent(&mut self, parent: Option<(EntityType, String)>) {
        match parent {
            Some((t, id)) => {
                self.parent_type = Some(t);
                self.parent_id = Some(id);
            }
            None => {
                self.parent_type = None;
                self.parent_id = None;
            }
        }
    }

    pub fn parent(&self) -> Option<(EntityType, &str)> {
        match (self.parent_type, self.parent_id.as_deref()) {
            (Some(t), Some(id)) => Some((t, id)),
            _ => None,
        }
    }

    /// Identifier of this particular version, used in conflict references.
    pub fn version_id(&self) -> String {
        format!("{}@{}:{}", self.entity_id, self.instance_id, self.version)
    }
}
