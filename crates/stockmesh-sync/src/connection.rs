//! # Connection Manager
//!
//! Owns one [`MeshTransport`] per configured route and tracks how healthy
//! each route is.
//!
//! ## Route State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │        begin()            success                                       │
//! │  Idle ─────────► Syncing ─────────► Idle                                │
//! │   ▲                 │                                                   │
//! │   │                 │ failure                                           │
//! │   │                 ▼                                                   │
//! │   │              Error ── consecutive failures ≥ max_retries ──►        │
//! │   │                                                   Degraded          │
//! │   │                                                      │              │
//! │   └──────────── reset_degraded() on next scheduled tick ─┘              │
//! │                                                                         │
//! │  usable_routes(): every route that is not Degraded, by priority         │
//! │  (1 = best). A cycle syncs with all of them; the first is the active    │
//! │  route. None means the node is offline and keeps serving local data.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use stockmesh_core::RouteRecord;
use stockmesh_db::Database;

use crate::auth::MeshAuth;
use crate::config::{RouteConfig, SyncConfig};
use crate::error::SyncResult;
use crate::protocol::NodeInfo;
use crate::transport::MeshTransport;

/// Route switches kept in memory.
const SWITCH_HISTORY: usize = 50;

// =============================================================================
// Route State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    Idle,
    Syncing,
    Error,
    Degraded,
}

impl RouteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteState::Idle => "idle",
            RouteState::Syncing => "syncing",
            RouteState::Error => "error",
            RouteState::Degraded => "degraded",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "syncing" => RouteState::Syncing,
            "error" => RouteState::Error,
            "degraded" => RouteState::Degraded,
            _ => RouteState::Idle,
        }
    }
}

impl std::fmt::Display for RouteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change of the active route.
#[derive(Debug, Clone, Serialize)]
pub struct RouteSwitch {
    pub from: Option<String>,
    pub to: Option<String>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

// =============================================================================
// Route
// =============================================================================

/// A configured peer endpoint with its transport and health counters.
pub struct Route {
    id: String,
    config: RouteConfig,
    transport: MeshTransport,
    health: RwLock<RouteRecord>,
}

impl Route {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub fn transport(&self) -> &MeshTransport {
        &self.transport
    }

    pub async fn state(&self) -> RouteState {
        RouteState::parse(&self.health.read().await.status)
    }

    pub async fn snapshot(&self) -> RouteRecord {
        self.health.read().await.clone()
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route").field("id", &self.id).finish_non_exhaustive()
    }
}

fn fresh_record(id: &str, config: &RouteConfig) -> RouteRecord {
    RouteRecord {
        id: id.to_string(),
        url: config.url.clone(),
        route_type: config.route_type,
        priority: config.priority,
        timeout_secs: config.timeout_secs,
        status: RouteState::Idle.as_str().to_string(),
        success_count: 0,
        failure_count: 0,
        consecutive_failures: 0,
        avg_latency_ms: 0.0,
        last_success_at: None,
        last_failure_at: None,
        last_error: None,
        updated_at: Utc::now(),
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

pub struct ConnectionManager {
    db: Arc<Database>,
    routes: Vec<Arc<Route>>,
    max_failures: i64,
    active: RwLock<Option<String>>,
    history: RwLock<VecDeque<RouteSwitch>>,
}

impl ConnectionManager {
    /// Builds transports for every configured route, sorted by priority.
    ///
    /// Counters persisted by an earlier run are restored. A route that was
    /// degraded when the process stopped starts idle again.
    pub async fn new(db: Arc<Database>, config: &SyncConfig, auth: Arc<MeshAuth>) -> SyncResult<Self> {
        let mut routes = Vec::new();
        for route_config in config.sorted_routes() {
            let id = route_config.id();
            let transport = MeshTransport::for_route(&route_config, auth.clone(), &config.transport)?;

            let mut record = match db.routes().get(&id).await {
                Ok(Some(stored)) => stored,
                Ok(None) => fresh_record(&id, &route_config),
                Err(e) => {
                    warn!(route = %id, error = %e, "Failed to restore route stats");
                    fresh_record(&id, &route_config)
                }
            };
            record.url = route_config.url.clone();
            record.route_type = route_config.route_type;
            record.priority = route_config.priority;
            record.timeout_secs = route_config.timeout_secs;
            record.status = RouteState::Idle.as_str().to_string();
            record.consecutive_failures = 0;

            routes.push(Arc::new(Route {
                id,
                config: route_config,
                transport,
                health: RwLock::new(record),
            }));
        }

        info!(routes = routes.len(), "Connection manager ready");

        Ok(ConnectionManager {
            db,
            routes,
            max_failures: i64::from(config.transport.max_retries.max(1)),
            active: RwLock::new(None),
            history: RwLock::new(VecDeque::with_capacity(SWITCH_HISTORY)),
        })
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn route(&self, id: &str) -> Option<Arc<Route>> {
        self.routes.iter().find(|r| r.id == id).cloned()
    }

    /// Every route that is not degraded, best priority first. The first one
    /// is the active route; a switch is recorded when it changes.
    pub async fn usable_routes(&self) -> Vec<Arc<Route>> {
        let mut usable = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            if route.state().await != RouteState::Degraded {
                usable.push(route.clone());
            }
        }
        self.note_active(usable.first().map(|r| r.id.clone())).await;
        usable
    }

    /// First non-degraded route by priority.
    pub async fn select_route(&self) -> Option<Arc<Route>> {
        self.usable_routes().await.into_iter().next()
    }

    async fn note_active(&self, selected_id: Option<String>) {
        let mut active = self.active.write().await;
        if *active == selected_id {
            return;
        }
        let reason = match (&*active, &selected_id) {
            (None, Some(_)) => "route available",
            (Some(_), None) => "all routes degraded",
            _ => "failover",
        };
        info!(
            from = ?*active,
            to = ?selected_id,
            reason,
            "Active route changed"
        );
        self.push_history(RouteSwitch {
            from: active.clone(),
            to: selected_id.clone(),
            reason: reason.to_string(),
            at: Utc::now(),
        })
        .await;
        *active = selected_id;
    }

    pub async fn active_route(&self) -> Option<String> {
        self.active.read().await.clone()
    }

    /// Marks the start of a sync exchange on `route`.
    pub async fn begin(&self, route: &Route) {
        let mut health = route.health.write().await;
        if RouteState::parse(&health.status) != RouteState::Degraded {
            health.status = RouteState::Syncing.as_str().to_string();
        }
    }

    pub async fn record_success(&self, route: &Route, latency: Duration) {
        let snapshot = {
            let mut health = route.health.write().await;
            let latency_ms = latency.as_secs_f64() * 1000.0;
            health.success_count += 1;
            health.avg_latency_ms += (latency_ms - health.avg_latency_ms) / health.success_count as f64;
            health.consecutive_failures = 0;
            health.last_success_at = Some(Utc::now());
            health.status = RouteState::Idle.as_str().to_string();
            health.updated_at = Utc::now();
            health.clone()
        };
        debug!(route = %route.id, latency_ms = snapshot.avg_latency_ms, "Route exchange succeeded");
        self.persist(&snapshot).await;
    }

    /// Counts a failed exchange. Returns the route's new state.
    pub async fn record_failure(&self, route: &Route, error: &str) -> RouteState {
        let snapshot = {
            let mut health = route.health.write().await;
            health.failure_count += 1;
            health.consecutive_failures += 1;
            health.last_failure_at = Some(Utc::now());
            health.last_error = Some(error.to_string());
            let state = if health.consecutive_failures >= self.max_failures {
                RouteState::Degraded
            } else {
                RouteState::Error
            };
            health.status = state.as_str().to_string();
            health.updated_at = Utc::now();
            health.clone()
        };

        let state = RouteState::parse(&snapshot.status);
        if state == RouteState::Degraded {
            warn!(
                route = %route.id,
                failures = snapshot.consecutive_failures,
                error = %error,
                "Route degraded"
            );
        } else {
            debug!(route = %route.id, error = %error, "Route exchange failed");
        }
        self.persist(&snapshot).await;
        state
    }

    /// Gives degraded routes another chance. Called on every scheduled tick.
    pub async fn reset_degraded(&self) -> usize {
        let mut reset = 0;
        for route in &self.routes {
            let mut health = route.health.write().await;
            if RouteState::parse(&health.status) == RouteState::Degraded {
                health.status = RouteState::Idle.as_str().to_string();
                health.consecutive_failures = 0;
                reset += 1;
            }
        }
        if reset > 0 {
            debug!(count = reset, "Degraded routes re-enabled");
        }
        reset
    }

    /// Handshakes with every route and updates its counters.
    pub async fn health_check(&self, me: &NodeInfo) -> Vec<(String, bool)> {
        let mut results = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            let started = std::time::Instant::now();
            match route.transport.handshake(me).await {
                Ok(resp) => {
                    debug!(route = %route.id, peer = %resp.node.instance_id, "Health check ok");
                    self.record_success(route, started.elapsed()).await;
                    results.push((route.id.clone(), true));
                }
                Err(e) => {
                    self.record_failure(route, &e.to_string()).await;
                    results.push((route.id.clone(), false));
                }
            }
        }
        results
    }

    pub async fn snapshot(&self) -> Vec<RouteRecord> {
        let mut out = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            out.push(route.snapshot().await);
        }
        out
    }

    pub async fn history(&self) -> Vec<RouteSwitch> {
        self.history.read().await.iter().cloned().collect()
    }

    async fn push_history(&self, switch: RouteSwitch) {
        let mut history = self.history.write().await;
        if history.len() == SWITCH_HISTORY {
            history.pop_front();
        }
        history.push_back(switch);
    }

    async fn persist(&self, record: &RouteRecord) {
        if let Err(e) = self.db.routes().upsert(record).await {
            warn!(route = %record.id, error = %e, "Failed to persist route stats");
        }
    }
}
