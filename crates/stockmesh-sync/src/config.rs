//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     SYNC_ROLE=peer  INSTANCE_ID=nodeA  MESH_SECRET=...                 │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     $SYNC_CONFIG_PATH, else                                            │
//! │     ~/.config/stockmesh/sync.toml (Linux)                              │
//! │     ~/Library/Application Support/io.stockmesh.stockmesh/sync.toml     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     role = peer, priority_based conflicts, checksum for hot types      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! role = "peer"
//! conflict_resolution = "priority_based"
//! auto_sync_interval_secs = 300
//!
//! [node]
//! instance_id = "nodeA"
//! mesh_secret = "change-me"
//! base_url = "http://10.0.0.2:8080"
//!
//! [[routes]]
//! url = "http://10.0.0.1:8080"
//! route_type = "primary"
//! timeout_secs = 10
//! priority = 1
//!
//! [entities.tracking]
//! strategy = "checksum"
//! sync_interval_secs = 60
//! priority = 8
//! history_depth_days = 30
//! ```
//!
//! The config is loaded once at startup and shared as `Arc<SyncConfig>`; it
//! is never mutated during a run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use stockmesh_core::{
    ConflictStrategy, EntityType, NodeRole, RouteType, SyncDirection, SyncFilter, SyncMode,
    SyncStrategy, WriteOp, DEFAULT_RELAY_PACKET_TTL_HOURS, DEFAULT_TOMBSTONE_TTL_DAYS,
};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Node Identity
// =============================================================================

/// Identity of this node inside the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Stable instance id. Vector clock components are keyed by it.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Shared secret that signs mesh tokens.
    #[serde(default)]
    pub mesh_secret: String,

    /// URL other nodes use to reach this one (announced in the handshake).
    #[serde(default)]
    pub base_url: Option<String>,

    /// Advertised weight. Informational only; there is no election.
    #[serde(default = "default_weight")]
    pub weight: i32,
}

fn default_instance_id() -> String {
    format!("node-{}", &Uuid::new_v4().simple().to_string()[..8])
}

fn default_weight() -> i32 {
    50
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            instance_id: default_instance_id(),
            mesh_secret: String::new(),
            base_url: None,
            weight: default_weight(),
        }
    }
}

// =============================================================================
// Per-Entity Settings
// =============================================================================

/// Sync settings for one entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub strategy: SyncStrategy,

    /// Only used by the `filtered` strategy.
    #[serde(default)]
    pub filters: Vec<SyncFilter>,

    /// Days of history for `time_window`; 0 = all history.
    #[serde(default)]
    pub history_depth_days: u32,

    /// Records per cycle; 0 = no limit.
    #[serde(default)]
    pub max_records: u32,

    /// Minimum seconds between two scheduled syncs of this type.
    #[serde(default = "default_entity_interval")]
    pub sync_interval_secs: u64,

    /// 1-10, 10 = most important. Also orders the outbound queue.
    #[serde(default = "default_entity_priority")]
    pub priority: u8,
}

fn default_entity_interval() -> u64 {
    60
}

fn default_entity_priority() -> u8 {
    5
}

impl EntitySyncConfig {
    fn new(strategy: SyncStrategy, interval: u64, priority: u8, history: u32) -> Self {
        EntitySyncConfig {
            enabled: true,
            strategy,
            filters: Vec::new(),
            history_depth_days: history,
            max_records: 0,
            sync_interval_secs: interval,
            priority,
        }
    }

    /// Queue priority: lower runs first.
    pub fn queue_priority(&self) -> i32 {
        11 - i32::from(self.priority.clamp(1, 10))
    }
}

fn default_entities() -> BTreeMap<String, EntitySyncConfig> {
    use SyncStrategy::*;

    let mut devices = EntitySyncConfig::new(ActiveOnly, 60, 5, 0);
    devices.enabled = false;

    [
        (EntityType::Product, EntitySyncConfig::new(Checksum, 60, 10, 0)),
        (EntityType::Location, EntitySyncConfig::new(Checksum, 300, 8, 0)),
        (EntityType::Quant, EntitySyncConfig::new(Checksum, 60, 9, 0)),
        (EntityType::Lot, EntitySyncConfig::new(Full, 120, 7, 0)),
        (EntityType::Package, EntitySyncConfig::new(Full, 60, 8, 0)),
        (EntityType::Picking, EntitySyncConfig::new(Full, 120, 9, 0)),
        (EntityType::Partner, EntitySyncConfig::new(Full, 300, 6, 0)),
        (EntityType::Shipment, EntitySyncConfig::new(Checksum, 60, 9, 30)),
        (EntityType::Tracking, EntitySyncConfig::new(Checksum, 60, 8, 30)),
        (EntityType::Device, devices),
    ]
    .into_iter()
    .map(|(t, c)| (t.as_str().to_string(), c))
    .collect()
}

// =============================================================================
// Realtime / Transport / Cache / Security
// =============================================================================

/// Event-driven propagation of local writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Which local write events are queued for outbound delivery.
    #[serde(default = "default_events")]
    pub events: Vec<WriteOp>,

    /// Debounce window (milliseconds). Bursts inside it collapse.
    #[serde(default = "default_buffer_time")]
    pub buffer_time_ms: u64,

    /// Run a cycle as soon as a degraded route answers again.
    #[serde(default = "default_true")]
    pub auto_sync_on_reconnect: bool,
}

fn default_events() -> Vec<WriteOp> {
    vec![WriteOp::Create, WriteOp::Update, WriteOp::Delete]
}

fn default_buffer_time() -> u64 {
    1000
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        RealtimeSettings {
            enabled: true,
            events: default_events(),
            buffer_time_ms: default_buffer_time(),
            auto_sync_on_reconnect: true,
        }
    }
}

/// How requests to peers are shaped and retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Records per pull chunk / push batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts per request, and consecutive failures before a route degrades.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_true")]
    pub compression: bool,

    #[serde(default = "default_true")]
    pub delta_sync: bool,

    /// Push while pulling within one (route, type) task.
    #[serde(default = "default_true")]
    pub parallel_sync: bool,

    /// Concurrent (route, type) tasks.
    #[serde(default = "default_workers")]
    pub parallel_workers: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    3
}
fn default_workers() -> usize {
    2
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    30
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            compression: true,
            delta_sync: true,
            parallel_sync: true,
            parallel_workers: default_workers(),
            connect_timeout_secs: default_connect_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

/// Local read cache settings. Advisory for storage adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds, 0 = no expiry.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Megabytes.
    #[serde(default = "default_cache_size")]
    pub max_size_mb: u64,

    /// `lru`, `fifo` or `lfu`.
    #[serde(default = "default_eviction")]
    pub eviction_policy: String,
}

fn default_cache_ttl() -> u64 {
    3600
}
fn default_cache_size() -> u64 {
    100
}
fn default_eviction() -> String {
    "lru".to_string()
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            enabled: true,
            ttl_secs: default_cache_ttl(),
            max_size_mb: default_cache_size(),
            eviction_policy: default_eviction(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// Route all payloads through sealed relay envelopes.
    #[serde(default)]
    pub encryption_enabled: bool,

    /// Require a valid mesh token on every inter-node call.
    #[serde(default = "default_true")]
    pub signature_verification: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        SecuritySettings {
            encryption_enabled: false,
            signature_verification: true,
        }
    }
}

// =============================================================================
// Routes / Server / Relay / Database
// =============================================================================

/// One peer endpoint this node syncs against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub url: String,

    #[serde(default)]
    pub route_type: RouteType,

    #[serde(default = "default_route_timeout")]
    pub timeout_secs: u64,

    /// Lower = tried first.
    #[serde(default = "default_route_priority")]
    pub priority: i32,

    /// Bind outgoing sockets to IPv4 for this route.
    #[serde(default = "default_true")]
    pub force_ipv4: bool,
}

fn default_route_timeout() -> u64 {
    10
}
fn default_route_priority() -> i32 {
    1
}

impl RouteConfig {
    pub fn new(url: impl Into<String>, route_type: RouteType, timeout_secs: u64, priority: i32) -> Self {
        RouteConfig {
            url: url.into(),
            route_type,
            timeout_secs,
            priority,
            force_ipv4: true,
        }
    }

    /// Stable id derived from type and URL.
    pub fn id(&self) -> String {
        format!("{}:{}", self.route_type, self.url.trim_end_matches('/'))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Mesh HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            enabled: true,
            bind_address: default_bind_address(),
        }
    }
}

/// Blind relay usage (as a client) and relay limits (as a relay).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Relay to push envelopes to / pull them from.
    #[serde(default)]
    pub url: Option<String>,

    /// 32-byte network key, hex encoded. Never set on a relay.
    #[serde(default)]
    pub network_key: Option<String>,

    /// Instance ids that receive our sealed changes.
    #[serde(default)]
    pub recipients: Vec<String>,

    #[serde(default = "default_packet_ttl")]
    pub packet_ttl_hours: i64,

    #[serde(default = "default_max_packet")]
    pub max_packet_bytes: usize,

    #[serde(default = "default_relay_poll")]
    pub poll_interval_secs: u64,
}

fn default_packet_ttl() -> i64 {
    DEFAULT_RELAY_PACKET_TTL_HOURS
}
fn default_max_packet() -> usize {
    1024 * 1024
}
fn default_relay_poll() -> u64 {
    30
}

impl Default for RelaySettings {
    fn default() -> Self {
        RelaySettings {
            url: None,
            network_key: None,
            recipients: Vec::new(),
            packet_ttl_hours: default_packet_ttl(),
            max_packet_bytes: default_max_packet(),
            poll_interval_secs: default_relay_poll(),
        }
    }
}

impl RelaySettings {
    /// Decodes the network key. `Ok(None)` if unset.
    pub fn network_key_bytes(&self) -> SyncResult<Option<[u8; 32]>> {
        let Some(hex_key) = self.network_key.as_deref() else {
            return Ok(None);
        };
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| SyncError::InvalidConfig(format!("relay network key is not hex: {}", e)))?;
        let key: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            SyncError::InvalidConfig(format!("relay network key must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Some(key))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_db_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> String {
    "stockmesh.db".to_string()
}
fn default_db_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_db_connections(),
        }
    }
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub role: NodeRole,

    #[serde(default)]
    pub mode: SyncMode,

    #[serde(default)]
    pub direction: SyncDirection,

    // ----- scheduling -----
    #[serde(default = "default_true")]
    pub auto_sync_enabled: bool,

    #[serde(default = "default_auto_interval")]
    pub auto_sync_interval_secs: u64,

    #[serde(default = "default_true")]
    pub sync_on_startup: bool,

    // ----- limits -----
    /// Megabytes accepted per mesh request body.
    #[serde(default = "default_max_sync_size")]
    pub max_sync_size_mb: usize,

    /// Deadline for one (route, entity type) task.
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,

    #[serde(default)]
    pub conflict_resolution: ConflictStrategy,

    /// How many ancestor levels a write re-hashes.
    #[serde(default = "default_hierarchy_depth")]
    pub hierarchy_depth: usize,

    #[serde(default = "default_tombstone_ttl")]
    pub tombstone_ttl_days: i64,

    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    #[serde(default)]
    pub node: NodeSettings,

    /// Keyed by entity type wire string (`products`, `tracking`, ...).
    #[serde(default = "default_entities")]
    pub entities: BTreeMap<String, EntitySyncConfig>,

    #[serde(default)]
    pub realtime: RealtimeSettings,

    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub security: SecuritySettings,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub relay: RelaySettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

fn default_auto_interval() -> u64 {
    300
}
fn default_max_sync_size() -> usize {
    50
}
fn default_sync_timeout() -> u64 {
    300
}
fn default_hierarchy_depth() -> usize {
    3
}
fn default_tombstone_ttl() -> i64 {
    DEFAULT_TOMBSTONE_TTL_DAYS
}
fn default_maintenance_interval() -> u64 {
    3600
}
fn default_health_interval() -> u64 {
    30
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            enabled: true,
            role: NodeRole::default(),
            mode: SyncMode::default(),
            direction: SyncDirection::default(),
            auto_sync_enabled: true,
            auto_sync_interval_secs: default_auto_interval(),
            sync_on_startup: true,
            max_sync_size_mb: default_max_sync_size(),
            sync_timeout_secs: default_sync_timeout(),
            conflict_resolution: ConflictStrategy::default(),
            hierarchy_depth: default_hierarchy_depth(),
            tombstone_ttl_days: default_tombstone_ttl(),
            maintenance_interval_secs: default_maintenance_interval(),
            health_check_interval_secs: default_health_interval(),
            node: NodeSettings::default(),
            entities: default_entities(),
            realtime: RealtimeSettings::default(),
            transport: TransportSettings::default(),
            cache: CacheSettings::default(),
            security: SecuritySettings::default(),
            routes: Vec::new(),
            server: ServerSettings::default(),
            relay: RelaySettings::default(),
            database: DatabaseSettings::default(),
        }
    }
}

impl SyncConfig {
    /// Creates a config with defaults and a generated instance id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (`SYNC_CONFIG_PATH` or the platform config dir)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        let path = config_path
            .or_else(|| std::env::var("SYNC_CONFIG_PATH").ok().map(PathBuf::from))
            .or_else(Self::default_config_path);

        if let Some(path) = path {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.node.instance_id.trim().is_empty() {
            return Err(SyncError::MissingInstanceId);
        }

        let talks_to_mesh = !self.routes.is_empty() || self.server.enabled || self.relay.url.is_some();
        if talks_to_mesh && self.node.mesh_secret.is_empty() {
            return Err(SyncError::InvalidConfig(
                "mesh_secret is required when routes, relay or the server are enabled".into(),
            ));
        }

        for route in &self.routes {
            validate_http_url(&route.url)?;
            if route.timeout_secs == 0 {
                return Err(SyncError::InvalidConfig(format!(
                    "route {} has a zero timeout",
                    route.url
                )));
            }
        }
        if let Some(ref url) = self.node.base_url {
            validate_http_url(url)?;
        }
        if let Some(ref url) = self.relay.url {
            validate_http_url(url)?;
        }

        for (name, entity) in &self.entities {
            name.parse::<EntityType>()?;
            if !(1..=10).contains(&entity.priority) {
                return Err(SyncError::InvalidConfig(format!(
                    "entity {} priority must be between 1 and 10, got {}",
                    name, entity.priority
                )));
            }
            for filter in &entity.filters {
                filter.validate()?;
            }
        }

        if self.transport.batch_size == 0 {
            return Err(SyncError::InvalidConfig("batch_size must be greater than 0".into()));
        }
        if self.transport.parallel_workers == 0 {
            return Err(SyncError::InvalidConfig(
                "parallel_workers must be greater than 0".into(),
            ));
        }

        let key = self.relay.network_key_bytes()?;
        if self.role == NodeRole::BlindRelay {
            if key.is_some() {
                return Err(SyncError::InvalidConfig(
                    "a blind relay must not hold the network key".into(),
                ));
            }
        } else if self.security.encryption_enabled && key.is_none() {
            return Err(SyncError::InvalidConfig(
                "encryption_enabled requires relay.network_key".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup.
    pub(crate) fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).and_then(|v| parse_bool(&v));
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(v) = flag("SYNC_ENABLED") {
            self.enabled = v;
        }
        if let Some(v) = lookup("SYNC_ROLE") {
            match v.parse() {
                Ok(role) => {
                    debug!(role = %v, "Overriding node role from environment");
                    self.role = role;
                }
                Err(e) => warn!(error = %e, "Ignoring SYNC_ROLE"),
            }
        }
        if let Some(v) = lookup("SYNC_MODE") {
            match v.parse() {
                Ok(mode) => self.mode = mode,
                Err(e) => warn!(error = %e, "Ignoring SYNC_MODE"),
            }
        }
        if let Some(v) = lookup("SYNC_DIRECTION") {
            match v.parse() {
                Ok(direction) => self.direction = direction,
                Err(e) => warn!(error = %e, "Ignoring SYNC_DIRECTION"),
            }
        }
        if let Some(v) = flag("SYNC_AUTO_ENABLED") {
            self.auto_sync_enabled = v;
        }
        if let Some(v) = number("SYNC_AUTO_INTERVAL") {
            self.auto_sync_interval_secs = v;
        }
        if let Some(v) = lookup("SYNC_CONFLICT_RESOLUTION") {
            match v.parse() {
                Ok(strategy) => self.conflict_resolution = strategy,
                Err(e) => warn!(error = %e, "Ignoring SYNC_CONFLICT_RESOLUTION"),
            }
        }
        if let Some(v) = flag("SYNC_ENCRYPTION") {
            self.security.encryption_enabled = v;
        }
        if let Some(v) = flag("SYNC_COMPRESSION") {
            self.transport.compression = v;
        }
        if let Some(v) = flag("SYNC_DELTA") {
            self.transport.delta_sync = v;
        }
        if let Some(v) = flag("SYNC_PARALLEL") {
            self.transport.parallel_sync = v;
        }
        if let Some(v) = number("SYNC_WORKERS") {
            self.transport.parallel_workers = v as usize;
        }
        if let Some(v) = number("SYNC_REALTIME_BUFFER") {
            self.realtime.buffer_time_ms = v;
        }

        if let Some(url) = lookup("LOCAL_SERVER_INTERNAL_URL").filter(|u| !u.is_empty()) {
            debug!(url = %url, "Primary route from environment");
            self.set_route(RouteConfig::new(url, RouteType::Primary, 10, 1));
        }
        if let Some(url) = lookup("GLOBAL_SERVER_URL").filter(|u| !u.is_empty()) {
            debug!(url = %url, "Web route from environment");
            self.set_route(RouteConfig::new(url, RouteType::Web, 15, 2));
        }

        if let Some(v) = lookup("INSTANCE_ID") {
            self.node.instance_id = v;
        }
        if let Some(v) = lookup("MESH_SECRET") {
            self.node.mesh_secret = v;
        }
        if let Some(v) = lookup("BASE_URL") {
            self.node.base_url = Some(v);
        }
        if let Some(v) = lookup("SYNC_LISTEN_ADDR") {
            self.server.bind_address = v;
        }
        if let Some(v) = lookup("SYNC_RELAY_URL") {
            self.relay.url = Some(v);
        }
        if let Some(v) = lookup("SYNC_NETWORK_KEY") {
            self.relay.network_key = Some(v);
        }
        if let Some(v) = lookup("DATABASE_PATH") {
            self.database.path = v;
        }
    }

    /// Replaces the route of the same type, or adds it.
    fn set_route(&mut self, route: RouteConfig) {
        self.routes.retain(|r| r.route_type != route.route_type);
        self.routes.push(route);
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "stockmesh", "stockmesh")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn instance_id(&self) -> &str {
        &self.node.instance_id
    }

    pub fn is_relay(&self) -> bool {
        self.role == NodeRole::BlindRelay
    }

    /// Settings for one entity type, if configured.
    pub fn entity(&self, entity_type: EntityType) -> Option<&EntitySyncConfig> {
        self.entities.get(entity_type.as_str())
    }

    /// Enabled entity types, parents before children.
    pub fn enabled_entity_types(&self) -> Vec<EntityType> {
        EntityType::ALL
            .into_iter()
            .filter(|t| self.entity(*t).map(|c| c.enabled).unwrap_or(false))
            .collect()
    }

    /// Routes ordered by priority (lower first).
    pub fn sorted_routes(&self) -> Vec<RouteConfig> {
        let mut routes = self.routes.clone();
        routes.sort_by_key(|r| r.priority);
        routes
    }

    /// Should a local write of this kind be queued for peers?
    pub fn queues_event(&self, op: WriteOp) -> bool {
        self.realtime.enabled && self.realtime.events.contains(&op)
    }

    pub fn buffer_time(&self) -> Duration {
        Duration::from_millis(self.realtime.buffer_time_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_sync_size_mb.max(1) * 1024 * 1024
    }
}

fn validate_http_url(raw: &str) -> SyncResult<()> {
    let url = url::Url::parse(raw)?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(SyncError::InvalidUrl(format!(
            "URL must start with http:// or https://, got {}:// in {}",
            other, raw
        ))),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.node.instance_id = "nodeA".into();
        config.node.mesh_secret = "secret".into();
        config
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(config.node.instance_id.starts_with("node-"));
        assert_eq!(config.role, NodeRole::Peer);
        assert_eq!(config.conflict_resolution, ConflictStrategy::PriorityBased);
        assert_eq!(config.transport.batch_size, 100);
        assert_eq!(config.transport.parallel_workers, 2);
        assert_eq!(config.realtime.buffer_time_ms, 1000);
        assert_eq!(config.tombstone_ttl_days, 30);
        assert_eq!(config.relay.packet_ttl_hours, 168);

        let tracking = config.entity(EntityType::Tracking).unwrap();
        assert_eq!(tracking.strategy, SyncStrategy::Checksum);
        assert_eq!(tracking.history_depth_days, 30);
        assert!(!config.entity(EntityType::Device).unwrap().enabled);
    }

    #[test]
    fn test_enabled_types_parents_first() {
        let types = valid().enabled_entity_types();
        let loc = types.iter().position(|t| *t == EntityType::Location).unwrap();
        let quant = types.iter().position(|t| *t == EntityType::Quant).unwrap();
        assert!(loc < quant);
        assert!(!types.contains(&EntityType::Device));
    }

    #[test]
    fn test_config_validation() {
        let mut config = valid();
        assert!(config.validate().is_ok());

        config.node.instance_id = String::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingInstanceId)));

        let mut config = valid();
        config.node.mesh_secret = String::new();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.routes.push(RouteConfig::new("ws://10.0.0.1", RouteType::Primary, 10, 1));
        assert!(config.validate().is_err());

        let mut config = valid();
        config.transport.parallel_workers = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.entities.get_mut("products").unwrap().priority = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_network_key_rules() {
        let mut config = valid();
        config.security.encryption_enabled = true;
        assert!(config.validate().is_err());

        config.relay.network_key = Some("ab".repeat(32));
        assert!(config.validate().is_ok());

        config.relay.network_key = Some("ab".repeat(16));
        assert!(config.validate().is_err());

        let mut relay = valid();
        relay.role = NodeRole::BlindRelay;
        relay.relay.network_key = Some("ab".repeat(32));
        assert!(relay.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SYNC_ROLE", "relay"),
            ("SYNC_AUTO_INTERVAL", "45"),
            ("SYNC_CONFLICT_RESOLUTION", "manual"),
            ("SYNC_PARALLEL", "false"),
            ("LOCAL_SERVER_INTERNAL_URL", "http://10.0.0.1:8080"),
            ("GLOBAL_SERVER_URL", "https://hq.example.com"),
            ("INSTANCE_ID", "nodeB"),
        ]
        .into_iter()
        .collect();

        let mut config = valid();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.role, NodeRole::BlindRelay);
        assert_eq!(config.auto_sync_interval_secs, 45);
        assert_eq!(config.conflict_resolution, ConflictStrategy::Manual);
        assert!(!config.transport.parallel_sync);
        assert_eq!(config.instance_id(), "nodeB");

        let routes = config.sorted_routes();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].route_type, RouteType::Primary);
        assert_eq!(routes[0].timeout_secs, 10);
        assert_eq!(routes[1].route_type, RouteType::Web);
        assert_eq!(routes[1].timeout_secs, 15);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = valid();
        config.routes.push(RouteConfig::new("http://10.0.0.1:8080", RouteType::Primary, 10, 1));
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[node]"));
        assert!(toml_str.contains("[entities.tracking]"));

        let back: SyncConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.instance_id(), "nodeA");
        assert_eq!(back.routes, config.routes);
        assert!(back.validate().is_ok());
    }

    #[test]
    fn test_queue_priority_inverts_entity_priority() {
        let config = valid();
        let products = config.entity(EntityType::Product).unwrap().queue_priority();
        let partners = config.entity(EntityType::Partner).unwrap().queue_priority();
        assert!(products < partners);
    }
}
