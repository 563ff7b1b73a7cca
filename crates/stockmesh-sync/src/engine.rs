//! # Sync Engine
//!
//! Orchestrates pulls, pushes and checksum negotiation against every usable
//! route.
//!
//! ## Engine Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SyncEngine                                      │
//! │                                                                         │
//! │  TRIGGERS                                                              │
//! │  ────────                                                              │
//! │  scheduler tick (auto_sync_interval, per-type sync_interval gating)    │
//! │  realtime worker (queue entries whose debounce window elapsed)         │
//! │  admin trigger   (POST /api/mesh/trigger)                              │
//! │                                                                         │
//! │  ONE CYCLE                                                             │
//! │  ─────────                                                             │
//! │  usable_routes ──► handshake ──► per (route, type) (Semaphore, timeout)│
//! │                                                                         │
//! │     ┌──────────────── sync_pair(route, type) ────────────────┐         │
//! │     │  pull:  checksum & no watermark ─► negotiate_and_pull  │         │
//! │     │         otherwise               ─► pull_and_apply      │         │
//! │     │  push:  push_pending (queue) ─► mark_synced            │         │
//! │     │  kept-local ids ─► pushed back, rejected pushes pulled │         │
//! │     └─────────────────────────────────────────────────────────┘         │
//! │                                                                         │
//! │  record_success / record_failure on the route, record_cycle per type   │
//! │                                                                         │
//! │  BACKGROUND                                                            │
//! │  ──────────                                                            │
//! │  maintenance: purge tombstones, relay packets, processed queue rows    │
//! │  health:      handshake every route                                    │
//! │  relay poll:  RelayClient::run_once                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Watermarks only move inside the transaction that applied the record
//! they point at, so an aborted cycle resumes where it stopped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use stockmesh_core::{
    ClockOrdering, EntityMetadata, EntityType, MerkleTree, NodeRole, QueueEntry, RouteRecord, SyncMode,
    SyncStrategy,
};
use stockmesh_db::{CycleReport, Database};

use crate::auth::MeshAuth;
use crate::config::{EntitySyncConfig, SyncConfig};
use crate::connection::{ConnectionManager, Route};
use crate::error::{SyncError, SyncResult};
use crate::exchange::MAX_PULL_LIMIT;
use crate::inbound::{BatchReport, InboundApplier, Origin};
use crate::interceptor::WriteInterceptor;
use crate::protocol::{
    ApplyStatus, MerkleRequest, NegotiateRequest, NodeInfo, PullRequest, PushOperation, PushRequest,
    PushResponse, TriggerRequest, TriggerResponse, WireRecord,
};
use crate::registry::PeerRegistry;
use crate::relay::{RelayClient, SecurityLayer};
use crate::transport::{MeshTransport, TransportConfig};

/// Above this many differing buckets the full hash list is cheaper than
/// walking the tree bucket by bucket.
pub const MERKLE_BUCKET_THRESHOLD: usize = 4;

/// Completed and failed queue rows are kept this long.
const QUEUE_RETENTION_DAYS: i64 = 7;

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Idle,
    Syncing,
    /// Every route is degraded.
    Offline,
}

/// Snapshot for `GET /api/sync/status` and the event emitter.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: EngineState,
    pub role: NodeRole,
    pub instance_id: String,
    pub active_route: Option<String>,
    pub pending_queue: i64,
    pub pending_conflicts: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cycles: u64,
    pub records_synced: u64,
    pub conflicts_detected: u64,
    pub routes: Vec<RouteRecord>,
    pub peers: Vec<NodeInfo>,
}

impl SyncStatus {
    fn new(config: &SyncConfig) -> Self {
        SyncStatus {
            state: EngineState::Stopped,
            role: config.role,
            instance_id: config.instance_id().to_string(),
            active_route: None,
            pending_queue: 0,
            pending_conflicts: 0,
            last_sync_at: None,
            last_error: None,
            cycles: 0,
            records_synced: 0,
            conflicts_detected: 0,
            routes: Vec::new(),
            peers: Vec::new(),
        }
    }
}

/// Totals of one cycle across all routes and entity types.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    /// Routes that answered the handshake, by priority.
    pub routes: Vec<String>,
    pub peers: Vec<String>,
    pub pulled: usize,
    pub pushed: usize,
    pub conflicts_detected: usize,
    pub errors: Vec<String>,
    pub duration_ms: i64,
}

impl CycleSummary {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// What happened on one (route, entity type) pair.
#[derive(Debug, Clone, Default)]
pub struct PairReport {
    pub pulled: usize,
    pub pushed: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub full_sync: bool,
    pub last_error: Option<String>,
    /// Ids where our version beat the peer's. They go back out as pushes.
    kept_local_ids: Vec<String>,
}

impl PairReport {
    fn absorb(&mut self, batch: BatchReport) {
        self.pulled += batch.applied + batch.pending;
        self.conflicts += batch.conflicts_detected;
        self.failed += batch.failed;
        if batch.last_error.is_some() {
            self.last_error = batch.last_error;
        }
        self.kept_local_ids.extend(batch.kept_local_ids);
    }

    fn merge(&mut self, other: PairReport) {
        self.pulled += other.pulled;
        self.pushed += other.pushed;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
        self.full_sync |= other.full_sync;
        if other.last_error.is_some() {
            self.last_error = other.last_error;
        }
        self.kept_local_ids.extend(other.kept_local_ids);
    }
}

/// Housekeeping totals.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub tombstones_purged: u64,
    pub relay_packets_purged: u64,
    pub queue_rows_purged: u64,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives engine events (an embedding UI, a metrics bridge).
pub trait SyncEventEmitter: Send + Sync {
    fn emit_status(&self, status: &SyncStatus);

    fn emit_progress(&self, pending: i64, synced: u64);

    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_progress(&self, _pending: i64, _synced: u64) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Sync Engine
// =============================================================================

pub struct SyncEngine {
    config: Arc<SyncConfig>,
    db: Arc<Database>,
    auth: Arc<MeshAuth>,
    interceptor: Arc<WriteInterceptor>,
    applier: Arc<InboundApplier>,
    registry: Arc<PeerRegistry>,
    connections: Arc<ConnectionManager>,
    relay: Option<Arc<RelayClient>>,
    status: RwLock<SyncStatus>,
    emitter: Arc<dyn SyncEventEmitter>,
    workers: Arc<Semaphore>,
    /// One cycle at a time. Triggers queue behind the running one.
    cycle_lock: Mutex<()>,
    last_synced: Mutex<HashMap<EntityType, Instant>>,
    /// Peer instance id behind each route, learned from the handshake.
    route_peers: RwLock<HashMap<String, String>>,
}

impl SyncEngine {
    pub async fn new(config: SyncConfig, db: Arc<Database>) -> SyncResult<Self> {
        Self::with_emitter(config, db, Arc::new(NoOpEmitter)).await
    }

    pub async fn with_emitter(
        config: SyncConfig,
        db: Arc<Database>,
        emitter: Arc<dyn SyncEventEmitter>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let me = NodeInfo {
            instance_id: config.instance_id().to_string(),
            role: config.role,
            base_url: config.node.base_url.clone(),
            weight: config.node.weight,
            is_online: true,
            last_seen: Utc::now(),
        };
        let auth = Arc::new(
            MeshAuth::new(config.node.mesh_secret.clone(), me)
                .require_token(config.security.signature_verification),
        );

        let interceptor = Arc::new(WriteInterceptor::new(db.clone(), config.clone()));
        let applier = Arc::new(InboundApplier::new(db.clone(), config.clone(), interceptor.clone()));
        let registry = Arc::new(PeerRegistry::new(config.instance_id()));
        let connections = Arc::new(ConnectionManager::new(db.clone(), &config, auth.clone()).await?);

        let relay = match (&config.relay.url, config.is_relay()) {
            (Some(url), false) => match SecurityLayer::from_config(&config)? {
                Some(security) => {
                    let transport_config = TransportConfig {
                        max_retries: config.transport.max_retries.max(1),
                        ..TransportConfig::default()
                    };
                    let transport = MeshTransport::new(url, auth.clone(), transport_config)?;
                    Some(Arc::new(RelayClient::new(
                        db.clone(),
                        config.clone(),
                        transport,
                        security,
                        applier.clone(),
                    )))
                }
                None => {
                    warn!(relay = %url, "Relay configured without a network key, relay sync disabled");
                    None
                }
            },
            _ => None,
        };

        let workers = Arc::new(Semaphore::new(config.transport.parallel_workers.max(1)));
        let status = RwLock::new(SyncStatus::new(&config));

        info!(
            instance_id = %config.instance_id(),
            role = %config.role.as_str(),
            routes = connections.routes().len(),
            relay = relay.is_some(),
            "Sync engine created"
        );

        Ok(SyncEngine {
            config,
            db,
            auth,
            interceptor,
            applier,
            registry,
            connections,
            relay,
            status,
            emitter,
            workers,
            cycle_lock: Mutex::new(()),
            last_synced: Mutex::new(HashMap::new()),
            route_peers: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Arc<SyncConfig> {
        &self.config
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn auth(&self) -> &Arc<MeshAuth> {
        &self.auth
    }

    /// Local writes go through here.
    pub fn interceptor(&self) -> &Arc<WriteInterceptor> {
        &self.interceptor
    }

    pub fn applier(&self) -> &Arc<InboundApplier> {
        &self.applier
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn relay_client(&self) -> Option<&Arc<RelayClient>> {
        self.relay.as_ref()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawns the background loops. A blind relay only runs maintenance.
    pub async fn start(self: &Arc<Self>) -> SyncResult<SyncEngineHandle> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(self.clone().maintenance_loop(shutdown_tx.subscribe())));

        if !self.config.enabled {
            info!("Sync is disabled, only maintenance runs");
        } else if !self.config.is_relay() {
            tasks.push(tokio::spawn(self.clone().scheduler_loop(shutdown_tx.subscribe())));
            if self.config.realtime.enabled && self.config.direction.pushes() {
                tasks.push(tokio::spawn(self.clone().realtime_loop(shutdown_tx.subscribe())));
            }
            if !self.connections.routes().is_empty() {
                tasks.push(tokio::spawn(self.clone().health_loop(shutdown_tx.subscribe())));
            }
            if self.relay.is_some() {
                tasks.push(tokio::spawn(self.clone().relay_loop(shutdown_tx.subscribe())));
            }
        }

        self.set_state(EngineState::Idle).await;

        info!(
            instance_id = %self.config.instance_id(),
            tasks = tasks.len(),
            "Sync engine started"
        );

        Ok(SyncEngineHandle {
            engine: self.clone(),
            shutdown_tx,
            tasks,
        })
    }

    /// Current status with fresh counters.
    pub async fn status(&self) -> SyncStatus {
        let mut status = self.status.read().await.clone();
        status.active_route = self.connections.active_route().await;
        status.routes = self.connections.snapshot().await;
        status.peers = self.registry.list().await;
        match self.db.queue().count_pending().await {
            Ok(count) => status.pending_queue = count,
            Err(e) => debug!(error = %e, "Failed to count pending queue"),
        }
        match self.db.conflicts().count_pending().await {
            Ok(count) => status.pending_conflicts = count,
            Err(e) => debug!(error = %e, "Failed to count pending conflicts"),
        }
        status
    }

    async fn set_state(&self, state: EngineState) {
        self.status.write().await.state = state;
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Administrative trigger. The cycle runs in the background.
    pub fn trigger_sync(self: &Arc<Self>, request: TriggerRequest) -> TriggerResponse {
        if self.config.is_relay() {
            return TriggerResponse {
                accepted: false,
                message: "a blind relay does not sync".into(),
            };
        }
        if !self.config.enabled {
            return TriggerResponse {
                accepted: false,
                message: "sync is disabled".into(),
            };
        }

        let types = if request.entity_types.is_empty() {
            self.config.enabled_entity_types()
        } else {
            request.entity_types.clone()
        };

        let engine = self.clone();
        match request.entity_id {
            Some(entity_id) => {
                let Some(&entity_type) = types.first() else {
                    return TriggerResponse {
                        accepted: false,
                        message: "entity_id needs an entity type".into(),
                    };
                };
                let message = format!("sync of {}/{} scheduled", entity_type, entity_id);
                tokio::spawn(async move {
                    if let Err(e) = engine.request_entity_sync(entity_type, &entity_id).await {
                        warn!(entity_type = %entity_type, entity_id = %entity_id, error = %e, "Entity sync failed");
                    }
                });
                TriggerResponse {
                    accepted: true,
                    message,
                }
            }
            None => {
                let message = format!(
                    "{} sync of {} entity types scheduled",
                    if request.full { "full" } else { "incremental" },
                    types.len()
                );
                let full = request.full;
                tokio::spawn(async move {
                    if let Err(e) = engine.sync_now(&types, full).await {
                        warn!(error = %e, "Triggered sync failed");
                    }
                });
                TriggerResponse {
                    accepted: true,
                    message,
                }
            }
        }
    }

    /// Ignores watermarks for every enabled type.
    pub fn request_full_sync(self: &Arc<Self>) -> TriggerResponse {
        self.trigger_sync(TriggerRequest {
            entity_types: Vec::new(),
            full: true,
            entity_id: None,
        })
    }

    /// Pulls one entity by id from the active route, then pushes ours if the
    /// peer lacks it or holds an older version.
    pub async fn request_entity_sync(&self, entity_type: EntityType, entity_id: &str) -> SyncResult<()> {
        let route = self.connections.select_route().await.ok_or(SyncError::NoRoute)?;
        let peer = self.peer_for(&route).await?;

        let mut report = PairReport::default();
        let mut returned = Vec::new();
        if self.config.direction.pulls() {
            returned = self
                .pull_ids(&route, &peer, entity_type, vec![entity_id.to_string()], &mut report)
                .await?;
        }

        if self.config.direction.pushes() {
            let peer_lacks = !returned.iter().any(|id| id == entity_id);
            let we_won = report.kept_local_ids.iter().any(|id| id == entity_id);
            if peer_lacks || we_won {
                self.push_current(&route, entity_type, entity_id).await?;
            }
        }

        info!(
            entity_type = %entity_type,
            entity_id = %entity_id,
            route = %route.id(),
            pulled = report.pulled,
            "Entity sync finished"
        );
        Ok(())
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    /// Runs one cycle for `types` against every usable route and waits for it.
    pub async fn sync_now(self: &Arc<Self>, types: &[EntityType], full: bool) -> SyncResult<CycleSummary> {
        self.run_cycle(types, full).await
    }

    async fn run_cycle(self: &Arc<Self>, types: &[EntityType], full: bool) -> SyncResult<CycleSummary> {
        let _cycle = self.cycle_lock.lock().await;

        let routes = self.connections.usable_routes().await;
        if routes.is_empty() {
            self.set_state(EngineState::Offline).await;
            self.emitter.emit_error("No usable sync route", true);
            return Err(SyncError::NoRoute);
        }

        self.set_state(EngineState::Syncing).await;
        let started = Instant::now();
        let mut summary = CycleSummary::default();

        // A route whose handshake fails sits this cycle out.
        let mut reachable: Vec<(Arc<Route>, String)> = Vec::with_capacity(routes.len());
        let mut handshake_error = None;
        for route in routes {
            self.connections.begin(&route).await;
            match self.handshake(&route).await {
                Ok(peer) => reachable.push((route, peer)),
                Err(e) => {
                    warn!(route = %route.id(), error = %e, "Handshake failed, route skipped");
                    summary.errors.push(format!("{}: {}", route.id(), e));
                    self.finish_failed(&route, &e).await;
                    handshake_error = Some(e);
                }
            }
        }
        if reachable.is_empty() {
            return Err(handshake_error.unwrap_or(SyncError::NoRoute));
        }

        info!(
            routes = reachable.len(),
            types = types.len(),
            full,
            "Sync cycle started"
        );

        let mut join_set = JoinSet::new();
        for (route, peer) in &reachable {
            summary.routes.push(route.id().to_string());
            summary.peers.push(peer.clone());
            for &entity_type in types {
                if self.config.entity(entity_type).map(|e| e.enabled) != Some(true) {
                    continue;
                }
                let engine = self.clone();
                let route = route.clone();
                let peer = peer.clone();
                join_set.spawn(async move {
                    let pair_started = Instant::now();
                    let result = match engine.workers.clone().acquire_owned().await {
                        Ok(_permit) => {
                            match tokio::time::timeout(
                                engine.config.sync_timeout(),
                                engine.sync_pair(&route, &peer, entity_type, full),
                            )
                            .await
                            {
                                Ok(result) => result,
                                Err(_) => Err(SyncError::Timeout(format!(
                                    "{} sync exceeded {}s",
                                    entity_type, engine.config.sync_timeout_secs
                                ))),
                            }
                        }
                        Err(_) => Err(SyncError::ShuttingDown),
                    };
                    (route, entity_type, result, pair_started.elapsed())
                });
            }
        }

        let mut route_failures: HashMap<String, SyncError> = HashMap::new();

        while let Some(joined) = join_set.join_next().await {
            let (route, entity_type, result, elapsed) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Sync task panicked");
                    summary.errors.push(e.to_string());
                    continue;
                }
            };

            let mut cycle = CycleReport {
                duration_ms: elapsed.as_millis() as i64,
                ..Default::default()
            };
            match result {
                Ok(report) => {
                    summary.pulled += report.pulled;
                    summary.pushed += report.pushed;
                    summary.conflicts_detected += report.conflicts;
                    cycle.records_synced = (report.pulled + report.pushed) as i64;
                    cycle.conflicts_detected = report.conflicts as i64;
                    cycle.full_sync = report.full_sync || full;
                    if report.failed > 0 {
                        cycle.status = "partial".into();
                        cycle.error = report.last_error.clone();
                        if let Some(err) = report.last_error {
                            summary.errors.push(format!("{} {}: {}", route.id(), entity_type, err));
                        }
                    } else {
                        cycle.status = "success".into();
                        self.last_synced.lock().await.insert(entity_type, Instant::now());
                    }
                }
                Err(e) => {
                    warn!(entity_type = %entity_type, route = %route.id(), error = %e, "Entity type sync failed");
                    cycle.status = "error".into();
                    cycle.error = Some(e.to_string());
                    summary.errors.push(format!("{} {}: {}", route.id(), entity_type, e));
                    if e.is_retryable() {
                        route_failures.insert(route.id().to_string(), e);
                    }
                }
            }

            if let Err(e) = self.db.watermarks().record_cycle(route.id(), entity_type, &cycle).await {
                warn!(entity_type = %entity_type, error = %e, "Failed to record cycle");
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as i64;

        for (route, _) in &reachable {
            match route_failures.remove(route.id()) {
                Some(e) => self.finish_failed(route, &e).await,
                None => self.connections.record_success(route, started.elapsed()).await,
            }
        }

        {
            let mut status = self.status.write().await;
            status.state = EngineState::Idle;
            status.cycles += 1;
            status.records_synced += (summary.pulled + summary.pushed) as u64;
            status.conflicts_detected += summary.conflicts_detected as u64;
            status.last_sync_at = Some(Utc::now());
            status.last_error = summary.errors.last().cloned();
        }

        let status = self.status().await;
        self.emitter.emit_status(&status);
        self.emitter.emit_progress(status.pending_queue, status.records_synced);

        info!(
            routes = summary.routes.len(),
            pulled = summary.pulled,
            pushed = summary.pushed,
            conflicts = summary.conflicts_detected,
            errors = summary.errors.len(),
            duration_ms = summary.duration_ms,
            "Sync cycle finished"
        );
        Ok(summary)
    }

    async fn finish_failed(&self, route: &Route, error: &SyncError) {
        let state = self.connections.record_failure(route, &error.to_string()).await;
        let mut status = self.status.write().await;
        status.state = EngineState::Idle;
        status.last_error = Some(error.to_string());
        drop(status);
        self.emitter.emit_error(&error.to_string(), error.is_retryable());
        debug!(route = %route.id(), state = %state, "Cycle ended with route failure");
    }

    async fn handshake(&self, route: &Route) -> SyncResult<String> {
        let response = route.transport().handshake(self.auth.node()).await?;
        let peer = response.node.instance_id.clone();
        self.registry.register(response.node).await;
        self.route_peers
            .write()
            .await
            .insert(route.id().to_string(), peer.clone());
        Ok(peer)
    }

    async fn peer_for(&self, route: &Route) -> SyncResult<String> {
        if let Some(peer) = self.route_peers.read().await.get(route.id()) {
            return Ok(peer.clone());
        }
        self.handshake(route).await
    }

    /// Pull then push one entity type on one route.
    pub async fn sync_pair(
        &self,
        route: &Route,
        peer: &str,
        entity_type: EntityType,
        full: bool,
    ) -> SyncResult<PairReport> {
        let Some(settings) = self.config.entity(entity_type).cloned() else {
            return Ok(PairReport::default());
        };
        let full = full || self.config.mode == SyncMode::Full;
        let pulls = self.config.direction.pulls();
        let pushes = self.config.direction.pushes();

        let pull = async {
            if !pulls {
                return Ok(PairReport::default());
            }
            let watermark = self.db.watermarks().since(route.id(), entity_type).await?;
            if settings.strategy == SyncStrategy::Checksum && (full || watermark.is_none()) {
                self.negotiate_and_pull(route, peer, entity_type).await
            } else {
                let since = if full { None } else { watermark };
                self.pull_and_apply(route, peer, entity_type, &settings, since).await
            }
        };
        let push = async {
            if !pushes {
                return Ok(PairReport::default());
            }
            self.push_pending(route, peer, entity_type).await
        };

        let (pulled, pushed) = if self.config.transport.parallel_sync {
            tokio::join!(pull, push)
        } else {
            let pulled = pull.await;
            (pulled, push.await)
        };

        let mut report = pulled?;
        report.merge(pushed?);

        // Our version won on these; the peer is behind.
        let kept_local = std::mem::take(&mut report.kept_local_ids);
        if pushes {
            for entity_id in kept_local {
                if let Some(response) = self.push_current(route, entity_type, &entity_id).await? {
                    if response.status == ApplyStatus::Applied {
                        report.pushed += 1;
                    }
                }
            }
        }

        debug!(
            entity_type = %entity_type,
            route = %route.id(),
            pulled = report.pulled,
            pushed = report.pushed,
            conflicts = report.conflicts,
            "Pair synced"
        );
        Ok(report)
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Pulls everything modified since `since`, chunk by chunk.
    ///
    /// Each applied batch advances the watermark in its own transactions; a
    /// failed record stops the loop so the next cycle restarts at it.
    pub async fn pull_and_apply(
        &self,
        route: &Route,
        peer: &str,
        entity_type: EntityType,
        settings: &EntitySyncConfig,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<PairReport> {
        let mut since = since;
        if settings.strategy == SyncStrategy::TimeWindow && settings.history_depth_days > 0 {
            let floor = Utc::now() - chrono::Duration::days(i64::from(settings.history_depth_days));
            since = Some(since.map_or(floor, |s| s.max(floor)));
        }

        let origin = Origin::pull(peer, route.id());
        let chunk = self.config.transport.batch_size.clamp(1, MAX_PULL_LIMIT);
        let cap = (settings.max_records > 0).then_some(settings.max_records as usize);

        let mut report = PairReport::default();
        let mut after_id: Option<String> = None;
        let mut fetched = 0usize;

        loop {
            let limit = match cap {
                Some(cap) if cap <= fetched => break,
                Some(cap) => chunk.min(cap - fetched),
                None => chunk,
            };
            let request = PullRequest {
                entity_types: vec![entity_type],
                since,
                after_id: after_id.clone(),
                ids: None,
                limit: Some(limit),
                strategy: Some(settings.strategy),
                filters: settings.filters.clone(),
            };
            let mut response = route.transport().pull(&request).await?;
            let records = response.take(entity_type);
            let cursor = response.cursors.remove(&entity_type);
            fetched += records.len();

            if settings.strategy == SyncStrategy::MetadataOnly {
                self.apply_metadata_page(route, peer, entity_type, records, &mut report)
                    .await?;
            } else {
                report.absorb(self.applier.apply_batch(entity_type, records, &origin).await);
            }
            if report.failed > 0 {
                break;
            }

            match cursor {
                Some(cursor) => {
                    since = Some(cursor.since);
                    after_id = Some(cursor.after_id);
                }
                None => break,
            }
        }

        Ok(report)
    }

    /// Second phase of a `metadata_only` pull: decide locally which payloads
    /// are worth fetching, fetch them by id, then move the watermark past
    /// the page.
    async fn apply_metadata_page(
        &self,
        route: &Route,
        peer: &str,
        entity_type: EntityType,
        records: Vec<WireRecord>,
        report: &mut PairReport,
    ) -> SyncResult<()> {
        let Some(last_seen) = records.last().map(|r| r.metadata.modified_at) else {
            return Ok(());
        };
        let ids: Vec<String> = records.iter().map(|r| r.entity_id.clone()).collect();
        let local: HashMap<String, EntityMetadata> = self
            .db
            .metadata()
            .by_ids(entity_type, &ids)
            .await?
            .into_iter()
            .map(|m| (m.entity_id.clone(), m))
            .collect();

        let mut direct = Vec::new();
        let mut fetch = Vec::new();
        for record in records {
            if record.is_tombstone() {
                direct.push(record);
                continue;
            }
            match local.get(&record.entity_id) {
                Some(mine) if !mine.deleted && mine.content_hash == record.metadata.content_hash => {
                    direct.push(record);
                }
                Some(mine)
                    if mine.vector_clock.compare(&record.metadata.vector_clock) == ClockOrdering::Dominates =>
                {
                    report.kept_local_ids.push(record.entity_id);
                }
                _ => fetch.push(record.entity_id),
            }
        }

        let before = report.failed;
        report.absorb(
            self.applier
                .apply_batch(entity_type, direct, &Origin::push(peer))
                .await,
        );
        if !fetch.is_empty() {
            self.pull_ids(route, peer, entity_type, fetch, report).await?;
        }

        if report.failed == before {
            let mut tx = self.db.begin().await?;
            self.db
                .watermarks()
                .advance_in(&mut tx, route.id(), entity_type, last_seen)
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }

    /// Fetches explicit ids and applies them without moving the watermark.
    /// Returns the ids the peer actually had.
    async fn pull_ids(
        &self,
        route: &Route,
        peer: &str,
        entity_type: EntityType,
        ids: Vec<String>,
        report: &mut PairReport,
    ) -> SyncResult<Vec<String>> {
        let origin = Origin::push(peer);
        let chunk = self.config.transport.batch_size.clamp(1, MAX_PULL_LIMIT);
        let mut returned = Vec::new();

        for ids in ids.chunks(chunk) {
            let mut response = route
                .transport()
                .pull(&PullRequest::by_ids(entity_type, ids.to_vec()))
                .await?;
            let records = response.take(entity_type);
            returned.extend(records.iter().map(|r| r.entity_id.clone()));
            report.absorb(self.applier.apply_batch(entity_type, records, &origin).await);
        }
        Ok(returned)
    }

    // =========================================================================
    // Checksum Negotiation
    // =========================================================================

    /// Compares checksum trees with the peer and exchanges only the
    /// differing ids.
    pub async fn negotiate_and_pull(&self, route: &Route, peer: &str, entity_type: EntityType) -> SyncResult<PairReport> {
        let mut report = PairReport {
            full_sync: true,
            ..Default::default()
        };

        let hashes = self.db.checksums().full_hashes(entity_type).await?;
        let local = MerkleTree::from_hashes(hashes.clone());
        let transport = route.transport();

        let level0 = transport
            .merkle(&MerkleRequest {
                entity_type,
                bucket: None,
            })
            .await?;

        let (to_pull, to_push, server_time) = if level0.root == local.root() {
            (Vec::new(), Vec::new(), level0.server_time)
        } else {
            let differing = local.differing_buckets(&level0.buckets);
            if differing.len() <= MERKLE_BUCKET_THRESHOLD {
                let mut to_pull = Vec::new();
                let mut to_push = Vec::new();
                for bucket in differing {
                    let level1 = transport
                        .merkle(&MerkleRequest {
                            entity_type,
                            bucket: Some(bucket.clone()),
                        })
                        .await?;
                    let diff = local.diff_bucket(&bucket, &level1.entries);
                    to_pull.extend(diff.need_from_remote);
                    to_push.extend(diff.need_to_send);
                }
                (to_pull, to_push, level0.server_time)
            } else {
                let negotiated = transport.negotiate(&NegotiateRequest { entity_type, hashes }).await?;
                (negotiated.to_pull, negotiated.to_push, negotiated.server_time)
            }
        };

        debug!(
            entity_type = %entity_type,
            route = %route.id(),
            to_pull = to_pull.len(),
            to_push = to_push.len(),
            "Checksums compared"
        );

        if !to_pull.is_empty() {
            self.pull_ids(route, peer, entity_type, to_pull, &mut report).await?;
        }

        if self.config.direction.pushes() {
            let mut rejected = Vec::new();
            for entity_id in &to_push {
                if let Some(response) = self.push_current(route, entity_type, entity_id).await? {
                    match response.status {
                        ApplyStatus::Applied => report.pushed += 1,
                        // The peer holds something newer, e.g. a tombstone.
                        ApplyStatus::KeptLocal => rejected.push(entity_id.clone()),
                        _ => {}
                    }
                }
            }
            if !rejected.is_empty() {
                self.pull_ids(route, peer, entity_type, rejected, &mut report).await?;
            }
        }

        if report.failed == 0 {
            let mut tx = self.db.begin().await?;
            self.db
                .watermarks()
                .advance_in(&mut tx, route.id(), entity_type, server_time)
                .await?;
            tx.commit().await?;
        }
        Ok(report)
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Pushes every pending queue entry of one type, regardless of its
    /// debounce window.
    pub async fn push_pending(&self, route: &Route, peer: &str, entity_type: EntityType) -> SyncResult<PairReport> {
        let limit = self.config.transport.batch_size.max(1) as i64;
        let entries = self.db.queue().pending_for(entity_type, limit).await?;
        let mut report = PairReport::default();

        let mut rejected = Vec::new();
        for entry in entries {
            match self.push_entry(route, &entry).await {
                Ok(Some(ApplyStatus::Applied)) => report.pushed += 1,
                Ok(Some(ApplyStatus::KeptLocal)) => rejected.push(entry.entity_id.clone()),
                Ok(_) => {}
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    report.failed += 1;
                    report.last_error = Some(e.to_string());
                }
            }
        }

        if !rejected.is_empty() && self.config.direction.pulls() {
            self.pull_ids(route, peer, entity_type, rejected, &mut report).await?;
        }
        Ok(report)
    }

    /// Pushes the current state of a queued entity to one route and settles
    /// the queue row. Returns the peer's verdict, `None` when there was
    /// nothing to send.
    pub async fn push_entry(&self, route: &Route, entry: &QueueEntry) -> SyncResult<Option<ApplyStatus>> {
        if self.delivered_to(route, entry).await? {
            self.settle_entry(entry).await?;
            return Ok(None);
        }
        match self.push_current(route, entry.entity_type, &entry.entity_id).await {
            Ok(response) => {
                self.settle_entry(entry).await?;
                Ok(response.map(|r| r.status))
            }
            Err(e) => {
                let delay = self.retry_delay(entry.retry_count);
                let status = self.db.queue().mark_failed(&entry.id, &e.to_string(), delay).await?;
                warn!(
                    entity_type = %entry.entity_type,
                    entity_id = %entry.entity_id,
                    route = %route.id(),
                    queue_status = ?status,
                    error = %e,
                    "Push failed"
                );
                Err(e)
            }
        }
    }

    async fn delivered_to(&self, route: &Route, entry: &QueueEntry) -> SyncResult<bool> {
        Ok(self
            .db
            .metadata()
            .get(entry.entity_type, &entry.entity_id)
            .await?
            .is_some_and(|meta| meta.synced_routes.contains_key(route.id())))
    }

    /// Completes the queue row once the current version reached every
    /// usable route. Returns true when the row was closed.
    async fn settle_entry(&self, entry: &QueueEntry) -> SyncResult<bool> {
        if let Some(meta) = self.db.metadata().get(entry.entity_type, &entry.entity_id).await? {
            for route in self.connections.usable_routes().await {
                if !meta.synced_routes.contains_key(route.id()) {
                    return Ok(false);
                }
            }
        }
        let closed = self.db.queue().mark_completed(entry).await?;
        if !closed {
            debug!(entity_id = %entry.entity_id, "Queue entry re-armed during push");
        }
        Ok(closed)
    }

    /// Sends the entity as it is stored now. Tombstones go out as deletes.
    async fn push_current(
        &self,
        route: &Route,
        entity_type: EntityType,
        entity_id: &str,
    ) -> SyncResult<Option<PushResponse>> {
        let Some(metadata) = self.db.metadata().get(entity_type, entity_id).await? else {
            return Ok(None);
        };
        let data = if metadata.deleted {
            None
        } else {
            match self.db.records().get(entity_type, entity_id).await? {
                Some(record) => Some(record.data),
                None => {
                    warn!(entity_type = %entity_type, entity_id = %entity_id, "Metadata without payload, not pushed");
                    return Ok(None);
                }
            }
        };

        let artifacts = self.db.conflicts().carried_by(&metadata).await?;
        let request = PushRequest {
            entity_type,
            entity_id: entity_id.to_string(),
            operation: if metadata.deleted {
                PushOperation::Delete
            } else {
                PushOperation::Upsert
            },
            data,
            metadata,
            artifacts,
        };
        let response = route.transport().push(&request).await?;

        // The peer has seen this version, whatever it decided.
        {
            let _guard = self.interceptor.locks().lock(entity_type, entity_id).await;
            if let Some(mut current) = self.db.metadata().get(entity_type, entity_id).await? {
                if current.version_id() == request.metadata.version_id()
                    && current.vector_clock == request.metadata.vector_clock
                {
                    current.mark_synced(route.id());
                    self.db.metadata().upsert(&current).await?;
                }
            }
        }

        debug!(
            entity_type = %entity_type,
            entity_id = %entity_id,
            route = %route.id(),
            status = %response.status,
            "Pushed"
        );
        Ok(Some(response))
    }

    fn retry_delay(&self, retry_count: i32) -> chrono::Duration {
        let base = self.config.transport.initial_backoff_ms.max(1);
        let factor = 2u64.saturating_pow(retry_count.clamp(0, 20) as u32);
        let max = self.config.transport.max_backoff_secs.saturating_mul(1000);
        chrono::Duration::milliseconds(base.saturating_mul(factor).min(max) as i64)
    }

    /// Pushes queue entries whose debounce window has elapsed to every
    /// usable route. Returns the number applied by peers.
    pub async fn drain_queue(&self) -> SyncResult<usize> {
        let limit = self.config.transport.batch_size.max(1) as i64;
        let entries = self.db.queue().due(Utc::now(), limit).await?;
        if entries.is_empty() {
            return Ok(0);
        }
        let routes = self.connections.usable_routes().await;
        if routes.is_empty() {
            debug!(pending = entries.len(), "No route, queue kept");
            return Ok(0);
        }

        let mut pushed = 0;
        let mut last_error = None;
        for route in routes {
            match self.drain_to(&route, &entries).await {
                Ok(n) => pushed += n,
                Err(e) => {
                    debug!(route = %route.id(), error = %e, "Realtime push to route deferred");
                    last_error = Some(e);
                }
            }
        }

        match (pushed, last_error) {
            (0, Some(e)) => Err(e),
            (pushed, _) => Ok(pushed),
        }
    }

    async fn drain_to(&self, route: &Route, entries: &[QueueEntry]) -> SyncResult<usize> {
        let peer = match self.peer_for(route).await {
            Ok(peer) => peer,
            Err(e) => {
                self.connections.record_failure(route, &e.to_string()).await;
                return Err(e);
            }
        };

        let started = Instant::now();
        let mut pushed = 0;
        let mut rejected: HashMap<EntityType, Vec<String>> = HashMap::new();
        for entry in entries {
            match self.push_entry(route, entry).await {
                Ok(Some(ApplyStatus::Applied)) => pushed += 1,
                Ok(Some(ApplyStatus::KeptLocal)) => rejected
                    .entry(entry.entity_type)
                    .or_default()
                    .push(entry.entity_id.clone()),
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    self.connections.record_failure(route, &e.to_string()).await;
                    return Err(e);
                }
                Err(_) => {}
            }
        }
        self.connections.record_success(route, started.elapsed()).await;

        if self.config.direction.pulls() {
            for (entity_type, ids) in rejected {
                let mut report = PairReport::default();
                self.pull_ids(route, &peer, entity_type, ids, &mut report).await?;
            }
        }

        if pushed > 0 {
            debug!(pushed, route = %route.id(), "Realtime push");
        }
        Ok(pushed)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    pub async fn run_maintenance(&self) -> SyncResult<MaintenanceReport> {
        let now = Utc::now();
        let mut report = MaintenanceReport::default();

        if !self.config.is_relay() {
            let cutoff = now - chrono::Duration::days(self.config.tombstone_ttl_days.max(1));
            report.tombstones_purged = self.db.metadata().purge_tombstones(cutoff).await?;
            report.queue_rows_purged = self
                .db
                .queue()
                .purge_processed(now - chrono::Duration::days(QUEUE_RETENTION_DAYS))
                .await?;
        }
        report.relay_packets_purged = self.db.relay_packets().purge_expired(now).await?;

        if report.tombstones_purged + report.relay_packets_purged + report.queue_rows_purged > 0 {
            info!(
                tombstones = report.tombstones_purged,
                relay_packets = report.relay_packets_purged,
                queue_rows = report.queue_rows_purged,
                "Maintenance purged rows"
            );
        }
        Ok(report)
    }

    // =========================================================================
    // Background Loops
    // =========================================================================

    async fn due_types(&self) -> Vec<EntityType> {
        let last_synced = self.last_synced.lock().await;
        self.config
            .enabled_entity_types()
            .into_iter()
            .filter(|t| {
                let every = self
                    .config
                    .entity(*t)
                    .map(|e| Duration::from_secs(e.sync_interval_secs))
                    .unwrap_or_default();
                last_synced.get(t).map_or(true, |at| at.elapsed() >= every)
            })
            .collect()
    }

    async fn scheduler_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.config.auto_sync_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut startup = self.config.sync_on_startup;
        if !startup {
            // The first tick fires immediately.
            ticker.tick().await;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let run_startup = std::mem::take(&mut startup);
                    if !self.config.auto_sync_enabled && !run_startup {
                        continue;
                    }
                    self.connections.reset_degraded().await;
                    let due = if run_startup {
                        self.config.enabled_entity_types()
                    } else {
                        self.due_types().await
                    };
                    if due.is_empty() {
                        continue;
                    }
                    let full = self.config.mode == SyncMode::Full;
                    if let Err(e) = self.run_cycle(&due, full).await {
                        warn!(error = %e, "Scheduled sync failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Scheduler received shutdown");
                    break;
                }
            }
        }
    }

    async fn realtime_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = self.config.buffer_time().max(Duration::from_millis(100));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_queue().await {
                        debug!(error = %e, "Realtime push deferred");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Realtime worker received shutdown");
                    break;
                }
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.config.maintenance_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_maintenance().await {
                        warn!(error = %e, "Maintenance failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Maintenance received shutdown");
                    break;
                }
            }
        }
    }

    async fn health_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.config.health_check_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Startup is covered by the scheduler.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let was_offline = self.status.read().await.state == EngineState::Offline;
                    let results = self.connections.health_check(self.auth.node()).await;
                    let reachable = results.iter().any(|(_, ok)| *ok);

                    if was_offline && reachable {
                        info!("Route reachable again");
                        self.set_state(EngineState::Idle).await;
                        if self.config.realtime.auto_sync_on_reconnect {
                            let types = self.config.enabled_entity_types();
                            if let Err(e) = self.run_cycle(&types, false).await {
                                warn!(error = %e, "Reconnect sync failed");
                            }
                        }
                    } else if !reachable {
                        self.set_state(EngineState::Offline).await;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Health check received shutdown");
                    break;
                }
            }
        }
    }

    async fn relay_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let Some(relay) = self.relay.clone() else {
            return;
        };
        let mut ticker = interval(Duration::from_secs(self.config.relay.poll_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match relay.run_once().await {
                        Ok(report) => debug!(
                            sealed = report.sealed,
                            received = report.received,
                            applied = report.applied,
                            "Relay exchange"
                        ),
                        Err(e) => warn!(relay = %relay.route_id(), error = %e, "Relay exchange failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Relay poller received shutdown");
                    break;
                }
            }
        }
    }
}

// =============================================================================
// Engine Handle
// =============================================================================

/// Handle for a running engine.
pub struct SyncEngineHandle {
    engine: Arc<SyncEngine>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncEngineHandle {
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub async fn status(&self) -> SyncStatus {
        self.engine.status().await
    }

    /// Stops every loop and waits for the running iteration to end.
    pub async fn shutdown(self) {
        info!("Shutting down sync engine");
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Engine task ended abnormally");
            }
        }
        self.engine.set_state(EngineState::Stopped).await;
        info!("Sync engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stockmesh_core::{RouteType, TruthSource};
    use stockmesh_db::DbConfig;

    use crate::config::RouteConfig;
    use crate::interceptor::WriteContext;

    async fn engine(routes: Vec<RouteConfig>) -> Arc<SyncEngine> {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let mut config = SyncConfig::default();
        config.node.instance_id = "nodeA".into();
        config.node.mesh_secret = "secret".into();
        config.transport.max_retries = 1;
        config.routes = routes;
        Arc::new(SyncEngine::new(config, db).await.unwrap())
    }

    #[tokio::test]
    async fn test_status_counts_queue() {
        let engine = engine(Vec::new()).await;
        engine
            .interceptor()
            .upsert(
                EntityType::Tracking,
                "TEST-1",
                &json!({"status": "in_transit"}),
                &WriteContext::new(TruthSource::Local),
            )
            .await
            .unwrap();

        let status = engine.status().await;
        assert_eq!(status.state, EngineState::Stopped);
        assert_eq!(status.instance_id, "nodeA");
        assert_eq!(status.pending_queue, 1);
        assert_eq!(status.pending_conflicts, 0);
        assert!(status.routes.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_without_routes_is_offline() {
        let engine = engine(Vec::new()).await;
        let err = engine.sync_now(&[EntityType::Product], false).await.unwrap_err();
        assert!(matches!(err, SyncError::NoRoute));
        assert_eq!(engine.status().await.state, EngineState::Offline);
    }

    #[tokio::test]
    async fn test_unreachable_route_degrades() {
        let route = RouteConfig::new("http://127.0.0.1:9", RouteType::Primary, 1, 1);
        let engine = engine(vec![route]).await;

        assert!(engine.sync_now(&[EntityType::Product], false).await.is_err());
        let status = engine.status().await;
        assert_eq!(status.routes[0].status, "degraded");
        assert!(status.last_error.is_some());

        // Next attempt finds no usable route until the scheduler resets it.
        assert!(matches!(
            engine.sync_now(&[EntityType::Product], false).await.unwrap_err(),
            SyncError::NoRoute
        ));
        assert_eq!(engine.connections().reset_degraded().await, 1);
    }

    #[tokio::test]
    async fn test_trigger_rejected_on_relay() {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let mut config = SyncConfig::default();
        config.node.instance_id = "relay1".into();
        config.node.mesh_secret = "secret".into();
        config.role = NodeRole::BlindRelay;
        let engine = Arc::new(SyncEngine::new(config, db).await.unwrap());

        assert!(engine.relay_client().is_none());
        let response = engine.trigger_sync(TriggerRequest::default());
        assert!(!response.accepted);
    }

    #[tokio::test]
    async fn test_maintenance_and_handle_shutdown() {
        let engine = engine(Vec::new()).await;
        let report = engine.run_maintenance().await.unwrap();
        assert_eq!(report.tombstones_purged, 0);

        let handle = engine.start().await.unwrap();
        assert_eq!(handle.status().await.state, EngineState::Idle);
        handle.shutdown().await;
        assert_eq!(engine.status().await.state, EngineState::Stopped);
    }

    #[test]
    fn test_pair_report_absorbs_batches() {
        let mut report = PairReport::default();
        report.absorb(BatchReport {
            applied: 2,
            pending: 1,
            conflicts_detected: 1,
            kept_local_ids: vec!["P1".into()],
            ..Default::default()
        });
        assert_eq!(report.pulled, 3);
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.kept_local_ids, vec!["P1".to_string()]);
        assert_eq!(report.failed, 0);
    }
}
