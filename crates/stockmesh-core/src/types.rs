//! # Sync Domain Types
//!
//! Enumerations shared by every layer: what is synchronized, who produced a
//! change, and how the mesh is configured to treat it.
//!
//! Every enum here has a stable snake_case wire string used in JSON, TOML,
//! environment variables and SQLite columns.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Entity Type
// =============================================================================

/// Kinds of warehouse entities the mesh replicates.
///
/// Wire strings are plural (`"products"`, `"locations"`) because they double
/// as keys of the pull response object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    #[serde(rename = "products")]
    Product,
    #[serde(rename = "locations")]
    Location,
    #[serde(rename = "quants")]
    Quant,
    #[serde(rename = "lots")]
    Lot,
    #[serde(rename = "packages")]
    Package,
    #[serde(rename = "pickings")]
    Picking,
    #[serde(rename = "partners")]
    Partner,
    #[serde(rename = "shipments")]
    Shipment,
    #[serde(rename = "tracking")]
    Tracking,
    #[serde(rename = "devices")]
    Device,
}

impl EntityType {
    /// All synchronized entity types, parents before children.
    pub const ALL: [EntityType; 10] = [
        EntityType::Partner,
        EntityType::Location,
        EntityType::Product,
        EntityType::Lot,
        EntityType::Package,
        EntityType::Quant,
        EntityType::Picking,
        EntityType::Shipment,
        EntityType::Tracking,
        EntityType::Device,
    ];

    /// Wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Product => "products",
            EntityType::Location => "locations",
            EntityType::Quant => "quants",
            EntityType::Lot => "lots",
            EntityType::Package => "packages",
            EntityType::Picking => "pickings",
            EntityType::Partner => "partners",
            EntityType::Shipment => "shipments",
            EntityType::Tracking => "tracking",
            EntityType::Device => "devices",
        }
    }

    /// Types where a physical scan is the authoritative source of truth.
    pub fn is_physical(&self) -> bool {
        matches!(
            self,
            EntityType::Quant | EntityType::Package | EntityType::Location | EntityType::Picking
        )
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().as_str() {
            "products" | "product" => Ok(EntityType::Product),
            "locations" | "location" => Ok(EntityType::Location),
            "quants" | "quant" => Ok(EntityType::Quant),
            "lots" | "lot" => Ok(EntityType::Lot),
            "packages" | "package" => Ok(EntityType::Package),
            "pickings" | "picking" => Ok(EntityType::Picking),
            "partners" | "partner" => Ok(EntityType::Partner),
            "shipments" | "shipment" => Ok(EntityType::Shipment),
            "tracking" | "trackings" => Ok(EntityType::Tracking),
            "devices" | "device" => Ok(EntityType::Device),
            other => Err(CoreError::UnknownEntityType(other.to_string())),
        }
    }
}

// =============================================================================
// Truth Source & Priority
// =============================================================================

/// Fixed trust ranking of change producers.
///
/// ```text
/// Physical(100) > Local(80) > Regional(60) > Global(40) > External(20) > Undefined(0)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourcePriority {
    Undefined = 0,
    External = 20,
    Global = 40,
    Regional = 60,
    Local = 80,
    Physical = 100,
}

impl SourcePriority {
    pub fn value(&self) -> i32 {
        *self as i32
    }

    /// Maps a stored integer back to the nearest defined level at or below it.
    pub fn from_value(value: i32) -> Self {
        match value {
            v if v >= 100 => SourcePriority::Physical,
            v if v >= 80 => SourcePriority::Local,
            v if v >= 60 => SourcePriority::Regional,
            v if v >= 40 => SourcePriority::Global,
            v if v >= 20 => SourcePriority::External,
            _ => SourcePriority::Undefined,
        }
    }
}

/// The kind of actor that produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TruthSource {
    /// Physical device scan (handheld PDA).
    #[serde(rename = "pda")]
    Physical,
    /// Action on the local warehouse server.
    #[serde(rename = "local_server")]
    Local,
    /// Action on the web / global server.
    #[serde(rename = "web_server")]
    Global,
    /// Import from an external API or ERP.
    #[serde(rename = "api_external")]
    External,
    /// Unknown or internal bookkeeping.
    #[default]
    #[serde(rename = "internal", alias = "undefined")]
    Undefined,
}

impl TruthSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TruthSource::Physical => "pda",
            TruthSource::Local => "local_server",
            TruthSource::Global => "web_server",
            TruthSource::External => "api_external",
            TruthSource::Undefined => "internal",
        }
    }

    /// Priority associated with this source.
    pub fn priority(&self) -> SourcePriority {
        match self {
            TruthSource::Physical => SourcePriority::Physical,
            TruthSource::Local => SourcePriority::Local,
            TruthSource::Global => SourcePriority::Global,
            TruthSource::External => SourcePriority::External,
            TruthSource::Undefined => SourcePriority::Undefined,
        }
    }
}

impl std::fmt::Display for TruthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TruthSource {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().as_str() {
            "pda" | "physical" | "scan" => Ok(TruthSource::Physical),
            "local_server" | "local" => Ok(TruthSource::Local),
            "web_server" | "web" | "global" => Ok(TruthSource::Global),
            "api_external" | "external" | "api" => Ok(TruthSource::External),
            "internal" | "undefined" | "" => Ok(TruthSource::Undefined),
            other => Err(CoreError::UnknownTruthSource(other.to_string())),
        }
    }
}

// =============================================================================
// Node Role
// =============================================================================

/// Role of a node in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Headquarters node. Wins under `server_wins`.
    Master,
    /// Ordinary full replica.
    #[default]
    Peer,
    /// Partial replica (remote scanner, small store).
    Edge,
    /// Store-and-forward node that cannot read payloads.
    BlindRelay,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Peer => "peer",
            NodeRole::Edge => "edge",
            NodeRole::BlindRelay => "blind_relay",
        }
    }

    /// True for roles that hold a readable copy of synchronized data.
    pub fn holds_data(&self) -> bool {
        !matches!(self, NodeRole::BlindRelay)
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeRole {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().as_str() {
            "master" | "hq" | "server" => Ok(NodeRole::Master),
            "peer" => Ok(NodeRole::Peer),
            "edge" | "client" => Ok(NodeRole::Edge),
            "blind_relay" | "relay" | "blind-relay" => Ok(NodeRole::BlindRelay),
            other => Err(CoreError::unknown(
                "node role",
                other,
                "master, peer, edge, blind_relay",
            )),
        }
    }
}

// =============================================================================
// Conflict Strategy
// =============================================================================

/// Policy applied when two versions are causally concurrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    ServerWins,
    ClientWins,
    LastWriteWins,
    Manual,
    #[default]
    PriorityBased,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::ClientWins => "client_wins",
            ConflictStrategy::LastWriteWins => "last_write_wins",
            ConflictStrategy::Manual => "manual",
            ConflictStrategy::PriorityBased => "priority_based",
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "server_wins" | "server" => Ok(ConflictStrategy::ServerWins),
            "client_wins" | "client" => Ok(ConflictStrategy::ClientWins),
            "last_write_wins" | "lww" => Ok(ConflictStrategy::LastWriteWins),
            "manual" => Ok(ConflictStrategy::Manual),
            "priority_based" | "priority" => Ok(ConflictStrategy::PriorityBased),
            other => Err(CoreError::unknown(
                "conflict resolution",
                other,
                "server_wins, client_wins, last_write_wins, manual, priority_based",
            )),
        }
    }
}

// =============================================================================
// Sync Strategy / Mode / Direction
// =============================================================================

/// How an entity type is selected for transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    #[default]
    Full,
    ActiveOnly,
    TimeWindow,
    Filtered,
    Checksum,
    MetadataOnly,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::Full => "full",
            SyncStrategy::ActiveOnly => "active_only",
            SyncStrategy::TimeWindow => "time_window",
            SyncStrategy::Filtered => "filtered",
            SyncStrategy::Checksum => "checksum",
            SyncStrategy::MetadataOnly => "metadata_only",
        }
    }
}

impl std::fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().as_str() {
            "full" => Ok(SyncStrategy::Full),
            "active_only" => Ok(SyncStrategy::ActiveOnly),
            "time_window" => Ok(SyncStrategy::TimeWindow),
            "filtered" => Ok(SyncStrategy::Filtered),
            "checksum" => Ok(SyncStrategy::Checksum),
            "metadata_only" => Ok(SyncStrategy::MetadataOnly),
            other => Err(CoreError::unknown(
                "sync strategy",
                other,
                "full, active_only, time_window, filtered, checksum, metadata_only",
            )),
        }
    }
}

/// Whether scheduled cycles pull everything or only changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    #[default]
    Incremental,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Incremental => write!(f, "incremental"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "incremental" | "delta" => Ok(SyncMode::Incremental),
            other => Err(CoreError::unknown("sync mode", other, "full, incremental")),
        }
    }
}

/// Which way data flows for this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[default]
    Bidirectional,
    PullOnly,
    PushOnly,
}

impl SyncDirection {
    pub fn pulls(&self) -> bool {
        !matches!(self, SyncDirection::PushOnly)
    }

    pub fn pushes(&self) -> bool {
        !matches!(self, SyncDirection::PullOnly)
    }
}

impl std::str::FromStr for SyncDirection {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().as_str() {
            "bidirectional" | "both" => Ok(SyncDirection::Bidirectional),
            "pull_only" | "pull" => Ok(SyncDirection::PullOnly),
            "push_only" | "push" => Ok(SyncDirection::PushOnly),
            other => Err(CoreError::unknown(
                "sync direction",
                other,
                "bidirectional, pull_only, push_only",
            )),
        }
    }
}

/// Kind of route a peer endpoint represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    #[default]
    Primary,
    Fallback,
    Web,
}

impl RouteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteType::Primary => "primary",
            RouteType::Fallback => "fallback",
            RouteType::Web => "web",
        }
    }
}

impl std::fmt::Display for RouteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RouteType {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().as_str() {
            "primary" | "local" => Ok(RouteType::Primary),
            "fallback" => Ok(RouteType::Fallback),
            "web" | "global" => Ok(RouteType::Web),
            other => Err(CoreError::unknown("route type", other, "primary, fallback, web")),
        }
    }
}

// =============================================================================
// Persisted Status Enums
// =============================================================================

/// Kind of local write observed by the interceptor.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    Create,
    Update,
    Delete,
}

impl WriteOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOp::Create => "create",
            WriteOp::Update => "update",
            WriteOp::Delete => "delete",
        }
    }
}

impl std::fmt::Display for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WriteOp {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().as_str() {
            "create" => Ok(WriteOp::Create),
            "update" => Ok(WriteOp::Update),
            "delete" => Ok(WriteOp::Delete),
            other => Err(CoreError::unknown("write event", other, "create, update, delete")),
        }
    }
}

/// Lifecycle of a sync queue entry.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

/// Lifecycle of a conflict record.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// Awaiting an operator decision.
    #[default]
    Pending,
    /// Decided, loser retained for audit.
    Resolved,
    /// Dismissed by an operator.
    Ignored,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Resolved => "resolved",
            ConflictStatus::Ignored => "ignored",
        }
    }
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConflictStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ConflictStatus::Pending),
            "resolved" => Ok(ConflictStatus::Resolved),
            "ignored" => Ok(ConflictStatus::Ignored),
            other => Err(CoreError::unknown(
                "conflict status",
                other,
                "pending, resolved, ignored",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_wire_strings() {
        assert_eq!(EntityType::Tracking.as_str(), "tracking");
        assert_eq!("location".parse::<EntityType>().unwrap(), EntityType::Location);
        assert_eq!("Shipments".parse::<EntityType>().unwrap(), EntityType::Shipment);
        assert!("widgets".parse::<EntityType>().is_err());
        assert_eq!(
            serde_json::to_string(&EntityType::Product).unwrap(),
            "\"products\""
        );
    }

    #[test]
    fn test_truth_source_priority_order() {
        assert!(TruthSource::Physical.priority() > TruthSource::Local.priority());
        assert!(TruthSource::Local.priority() > TruthSource::Global.priority());
        assert!(TruthSource::Global.priority() > TruthSource::External.priority());
        assert!(TruthSource::External.priority() > TruthSource::Undefined.priority());
        assert_eq!(TruthSource::Physical.priority().value(), 100);
    }

    #[test]
    fn test_truth_source_parsing() {
        assert_eq!("pda".parse::<TruthSource>().unwrap(), TruthSource::Physical);
        assert_eq!("web_server".parse::<TruthSource>().unwrap(), TruthSource::Global);
        let parsed: TruthSource = serde_json::from_str("\"undefined\"").unwrap();
        assert_eq!(parsed, TruthSource::Undefined);
    }

    #[test]
    fn test_source_priority_from_value() {
        assert_eq!(SourcePriority::from_value(100), SourcePriority::Physical);
        assert_eq!(SourcePriority::from_value(65), SourcePriority::Regional);
        assert_eq!(SourcePriority::from_value(-3), SourcePriority::Undefined);
    }

    #[test]
    fn test_node_role_aliases() {
        assert_eq!("relay".parse::<NodeRole>().unwrap(), NodeRole::BlindRelay);
        assert!(!NodeRole::BlindRelay.holds_data());
        assert!(NodeRole::Edge.holds_data());
    }

    #[test]
    fn test_conflict_strategy_parsing() {
        assert_eq!(
            "priority-based".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::PriorityBased
        );
        assert_eq!(ConflictStrategy::default(), ConflictStrategy::PriorityBased);
        assert!("coin_flip".parse::<ConflictStrategy>().is_err());
    }

    #[test]
    fn test_direction_flags() {
        assert!(SyncDirection::Bidirectional.pulls());
        assert!(SyncDirection::Bidirectional.pushes());
        assert!(!SyncDirection::PullOnly.pushes());
        assert!(!SyncDirection::PushOnly.pulls());
    }
}
