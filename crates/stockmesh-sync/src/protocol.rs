//! # Mesh Protocol Messages
//!
//! JSON bodies exchanged between nodes over HTTP.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Mesh Protocol Messages                             │
//! │                                                                         │
//! │  HANDSHAKE                                                             │
//! │  ─────────                                                             │
//! │  A ───► POST /mesh/handshake   NodeInfo (caller)                       │
//! │  A ◄─── HandshakeResponse      NodeInfo (server), protocol version     │
//! │                                                                         │
//! │  PULL (requester asks for what changed)                                │
//! │  ──────────────────────────────────────                                │
//! │  A ───► PullRequest  { entity_types, since, after_id, ids, limit }     │
//! │  A ◄─── PullResponse { <type>: [WireRecord], server_time, cursors }    │
//! │                                                                         │
//! │  PUSH (one change, idempotent)                                         │
//! │  ─────────────────────────────                                         │
//! │  A ───► PushRequest  { entity_type, entity_id, operation, data, meta } │
//! │  A ◄─── PushResponse { status, reason, version }                       │
//! │                                                                         │
//! │  CHECKSUM NEGOTIATION (checksum strategy)                              │
//! │  ────────────────────────────────────────                              │
//! │  A ───► MerkleRequest { bucket: None }     ◄─── root + bucket hashes   │
//! │  A ───► MerkleRequest { bucket: "s" }      ◄─── entity hashes          │
//! │  A ───► NegotiateRequest { hashes }        ◄─── ids to pull / push     │
//! │                                                                         │
//! │  BLIND RELAY                                                           │
//! │  ───────────                                                           │
//! │  A ───► RelayPushRequest { envelopes }     (sealed PushRequests)       │
//! │  B ───► RelayPullRequest { limit }         ◄─── EncryptedPackets       │
//! │  B ───► RelayAckRequest  { ids }                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every inter-node request carries `X-Instance-ID` and
//! `Authorization: Bearer <mesh token>` (see [`crate::auth`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use stockmesh_core::{
    EncryptedPacket, EntityMetadata, EntityType, NodeRole, SyncConflict, SyncFilter, SyncStrategy,
    WriteOp,
};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Header carrying the caller's instance id.
pub const INSTANCE_HEADER: &str = "x-instance-id";

// =============================================================================
// Node Identity
// =============================================================================

/// What a node announces about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub instance_id: String,
    pub role: NodeRole,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub weight: i32,
    #[serde(default = "default_online")]
    pub is_online: bool,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

fn default_online() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub node: NodeInfo,
    pub protocol_version: u32,
    pub server_time: DateTime<Utc>,
}

// =============================================================================
// Records on the Wire
// =============================================================================

/// One entity as it travels between nodes.
///
/// `data` is `None` for tombstones and for `metadata_only` pulls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    pub entity_id: String,
    #[serde(default)]
    pub data: Option<Value>,
    pub metadata: EntityMetadata,
    /// Automatically resolved conflicts this version took part in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<SyncConflict>,
}

impl WireRecord {
    pub fn is_tombstone(&self) -> bool {
        self.metadata.deleted
    }
}

// =============================================================================
// Pull
// =============================================================================

/// Asks a peer for everything that changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequest {
    pub entity_types: Vec<EntityType>,

    /// Inclusive lower bound on the server's `modified_at`.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,

    /// Keyset continuation: with `since`, resume strictly after
    /// `(since, after_id)`.
    #[serde(default)]
    pub after_id: Option<String>,

    /// Explicit ids (checksum strategy). `since` is ignored when set.
    #[serde(default)]
    pub ids: Option<Vec<String>>,

    /// Records per type in this chunk.
    #[serde(default)]
    pub limit: Option<usize>,

    /// Strategy hint: `active_only` hides archived rows and tombstones,
    /// `metadata_only` omits payloads.
    #[serde(default)]
    pub strategy: Option<SyncStrategy>,

    #[serde(default)]
    pub filters: Vec<SyncFilter>,
}

impl PullRequest {
    pub fn since(entity_type: EntityType, since: Option<DateTime<Utc>>) -> Self {
        PullRequest {
            entity_types: vec![entity_type],
            since,
            ..Default::default()
        }
    }

    pub fn by_ids(entity_type: EntityType, ids: Vec<String>) -> Self {
        PullRequest {
            entity_types: vec![entity_type],
            ids: Some(ids),
            ..Default::default()
        }
    }
}

/// Where the next chunk of one type starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullCursor {
    pub since: DateTime<Utc>,
    pub after_id: String,
}

/// `{ "<entity_type>": [...], "server_time": ..., "cursors": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub server_time: DateTime<Utc>,

    /// Types that hit the limit, with the cursor to continue from.
    #[serde(default)]
    pub cursors: BTreeMap<EntityType, PullCursor>,

    #[serde(flatten)]
    pub records: BTreeMap<EntityType, Vec<WireRecord>>,
}

impl PullResponse {
    pub fn new() -> Self {
        PullResponse {
            server_time: Utc::now(),
            cursors: BTreeMap::new(),
            records: BTreeMap::new(),
        }
    }

    pub fn has_more(&self) -> bool {
        !self.cursors.is_empty()
    }

    /// Takes the records of one type out of the response.
    pub fn take(&mut self, entity_type: EntityType) -> Vec<WireRecord> {
        self.records.remove(&entity_type).unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
}

impl Default for PullResponse {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Push
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOperation {
    Upsert,
    Delete,
}

impl From<WriteOp> for PushOperation {
    fn from(op: WriteOp) -> Self {
        match op {
            WriteOp::Delete => PushOperation::Delete,
            WriteOp::Create | WriteOp::Update => PushOperation::Upsert,
        }
    }
}

/// One change sent to a peer. Also the plaintext inside a relay envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: PushOperation,
    #[serde(default)]
    pub data: Option<Value>,
    pub metadata: EntityMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<SyncConflict>,
}

impl PushRequest {
    pub fn into_record(self) -> (EntityType, WireRecord) {
        (
            self.entity_type,
            WireRecord {
                entity_id: self.entity_id,
                data: self.data,
                metadata: self.metadata,
                artifacts: self.artifacts,
            },
        )
    }
}

/// What the receiving node did with an incoming version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    /// Remote version written locally.
    Applied,
    /// Local version kept (stale or lost the conflict).
    KeptLocal,
    /// Already identical.
    Unchanged,
    /// Recorded as a pending conflict for an operator.
    Pending,
    /// Equal clocks, different content. Left unresolved.
    IntegrityViolation,
}

impl ApplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyStatus::Applied => "applied",
            ApplyStatus::KeptLocal => "kept_local",
            ApplyStatus::Unchanged => "unchanged",
            ApplyStatus::Pending => "pending",
            ApplyStatus::IntegrityViolation => "integrity_violation",
        }
    }
}

impl std::fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub status: ApplyStatus,
    pub reason: String,
    /// Local version after the apply.
    pub version: i64,
}

// =============================================================================
// Checksum Negotiation
// =============================================================================

/// Level 0 (`bucket: None`) returns bucket hashes, level 1 the entity
/// hashes of one bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleRequest {
    pub entity_type: EntityType,
    #[serde(default)]
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MerkleResponse {
    pub root: String,
    /// Server clock when the hashes were read.
    #[serde(default)]
    pub server_time: DateTime<Utc>,
    #[serde(default)]
    pub buckets: BTreeMap<String, String>,
    #[serde(default)]
    pub entries: BTreeMap<String, String>,
}

/// The requester's full hashes for one type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiateRequest {
    pub entity_type: EntityType,
    pub hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NegotiateResponse {
    /// Ids the requester lacks, holds with a different hash, or holds while
    /// the server has a tombstone.
    pub to_pull: Vec<String>,
    /// Ids the server has never seen.
    pub to_push: Vec<String>,
    #[serde(default)]
    pub server_time: DateTime<Utc>,
}

impl NegotiateResponse {
    pub fn is_empty(&self) -> bool {
        self.to_pull.is_empty() && self.to_push.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareRequest {
    pub entity_type: EntityType,
    pub hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumComparison {
    pub entity_id: String,
    pub local_hash: Option<String>,
    pub remote_hash: String,
    pub matches: bool,
}

// =============================================================================
// Administration
// =============================================================================

/// Forces a cycle outside the schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerRequest {
    /// Empty = every enabled type.
    #[serde(default)]
    pub entity_types: Vec<EntityType>,
    /// Ignore watermarks and re-pull everything.
    #[serde(default)]
    pub full: bool,
    /// Restrict to one entity (pull by id, then push it).
    #[serde(default)]
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub accepted: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveConflictRequest {
    pub winner: ConflictChoice,
    #[serde(default)]
    pub resolved_by: Option<String>,
}

// =============================================================================
// Blind Relay
// =============================================================================

/// An envelope as submitted by its sender. The relay stamps the times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub version: i64,
    /// base64, 12 bytes.
    pub nonce: String,
    /// base64 AES-256-GCM output (ciphertext + tag).
    pub ciphertext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayPushRequest {
    pub envelopes: Vec<RelayEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRejection {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayPushResponse {
    pub accepted: Vec<String>,
    pub rejected: Vec<RelayRejection>,
}

/// The recipient is the authenticated caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayPullRequest {
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayPullResponse {
    pub packets: Vec<EncryptedPacket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayAckRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayAckResponse {
    pub removed: u64,
}
