//! # Persisted Sync Records
//!
//! Plain data types for the durable sync tables. `stockmesh-db` stores them,
//! `stockmesh-sync` moves some of them over the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metadata::EntityMetadata;
use crate::types::{ConflictStatus, EntityType, QueueStatus, RouteType, WriteOp};

/// Replicated payload of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    /// Records with `"active": false` are archived and skipped by
    /// `active_only` pulls.
    pub fn is_active(&self) -> bool {
        is_active(&self.data)
    }
}

/// `false` only when the payload carries `"active": false`.
pub fn is_active(data: &Value) -> bool {
    data.get("active").and_then(Value::as_bool).unwrap_or(true)
}

// =============================================================================
// Queue
// =============================================================================

/// Outbound notification waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: WriteOp,
    /// Entity-type priority, 1 is most urgent.
    pub priority: i32,
    pub status: QueueStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Not pushed before this instant (debounce window).
    pub scheduled_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Conflicts
// =============================================================================

/// A detected conflict, with both versions retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// `concurrent_update`, `delete_update` or `integrity_violation`.
    pub conflict_type: String,
    pub local_version: EntityMetadata,
    pub remote_version: EntityMetadata,
    pub local_data: Option<Value>,
    pub remote_data: Option<Value>,
    /// `local` / `remote`, unset while pending.
    pub winner: Option<String>,
    pub strategy: String,
    pub reason: String,
    pub status: ConflictStatus,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SyncConflict {
    /// True when `version_id` is one of the two branches.
    pub fn involves(&self, version_id: &str) -> bool {
        self.local_version.version_id() == version_id || self.remote_version.version_id() == version_id
    }

    /// The same artifact seen from the other side: local and remote swap,
    /// and so does the winner.
    pub fn mirrored(&self) -> SyncConflict {
        let winner = match self.winner.as_deref() {
            Some("local") => Some("remote".to_string()),
            Some("remote") => Some("local".to_string()),
            other => other.map(str::to_string),
        };
        SyncConflict {
            local_version: self.remote_version.clone(),
            remote_version: self.local_version.clone(),
            local_data: self.remote_data.clone(),
            remote_data: self.local_data.clone(),
            winner,
            ..self.clone()
        }
    }
}

// =============================================================================
// Routes & Watermarks
// =============================================================================

/// Health snapshot of one peer route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub id: String,
    pub url: String,
    pub route_type: RouteType,
    pub priority: i32,
    pub timeout_secs: u64,
    /// `idle`, `syncing`, `error`, `degraded`.
    pub status: String,
    pub success_count: i64,
    pub failure_count: i64,
    pub consecutive_failures: i64,
    pub avg_latency_ms: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Per (route, entity type) sync progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub route_id: String,
    pub entity_type: EntityType,
    /// Highest remote `modified_at` applied from this route.
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub status: String,
    pub records_synced: i64,
    pub conflicts_detected: i64,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Relay
// =============================================================================

/// Encrypted change held by a blind relay. The relay never sees plaintext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedPacket {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub version: i64,
    /// Base64 96-bit nonce.
    pub nonce: String,
    /// Base64 AES-256-GCM ciphertext including the tag.
    pub ciphertext: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub forwarded_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_active_flag() {
        assert!(is_active(&json!({"name": "x"})));
        assert!(is_active(&json!({"active": true})));
        assert!(!is_active(&json!({"active": false})));
    }

    #[test]
    fn test_mirrored_conflict_swaps_sides() {
        let mut local = EntityMetadata::new(EntityType::Location, "Shelf A", "nodeB");
        local.version = 3;
        let mut remote = EntityMetadata::new(EntityType::Location, "Shelf A", "nodeA");
        remote.version = 3;
        let conflict = SyncConflict {
            id: "c1".into(),
            entity_type: EntityType::Location,
            entity_id: "Shelf A".into(),
            conflict_type: "concurrent_update".into(),
            local_version: local,
            remote_version: remote,
            local_data: Some(json!({"usage": 25})),
            remote_data: Some(json!({"usage": 30})),
            winner: Some("remote".into()),
            strategy: "priority_based".into(),
            reason: "physical beats local".into(),
            status: ConflictStatus::Resolved,
            resolved_by: Some("auto:nodeB".into()),
            resolved_at: Some(Utc::now()),
            created_at: Utc::now(),
        };

        assert!(conflict.involves("Shelf A@nodeA:3"));
        assert!(conflict.involves("Shelf A@nodeB:3"));
        assert!(!conflict.involves("Shelf A@nodeC:3"));

        let mirrored = conflict.mirrored();
        assert_eq!(mirrored.id, "c1");
        assert_eq!(mirrored.local_version.instance_id, "nodeA");
        assert_eq!(mirrored.remote_data, Some(json!({"usage": 25})));
        assert_eq!(mirrored.winner.as_deref(), Some("local"));
        assert_eq!(mirrored.status, ConflictStatus::Resolved);
    }
}
