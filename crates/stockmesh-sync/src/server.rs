//! # Mesh Server
//!
//! The HTTP side of a node. Every route except `/health` authenticates the
//! caller before touching data.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       MeshServer (Axum)                                 │
//! │                                                                         │
//! │  GET  /health                          liveness                         │
//! │  POST /mesh/handshake                  register caller, return self     │
//! │  ─────────────────────── data roles only ───────────────────────────   │
//! │  GET  /api/mesh/nodes                  known peers                      │
//! │  POST /api/mesh/pull                   ExchangeService::pull            │
//! │  POST /api/mesh/push                   InboundApplier::apply_remote     │
//! │  POST /api/mesh/negotiate              ExchangeService::negotiate       │
//! │  POST /api/mesh/merkle                 ExchangeService::merkle          │
//! │  POST /api/mesh/trigger                SyncEngine::trigger_sync         │
//! │  GET  /api/sync/status                 SyncEngine::status               │
//! │  GET  /api/sync/checksums/{type}[/id]  stored checksums                 │
//! │  POST /api/sync/checksums/compare      compare supplied hashes          │
//! │  GET  /api/sync/conflicts              pending conflicts                │
//! │  POST /api/sync/conflicts/{id}/resolve manual resolution                │
//! │  ─────────────────────── every role ────────────────────────────────   │
//! │  POST /api/relay/push | pull | ack     RelayStore                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stockmesh_core::{ChecksumEntity, ConflictStatus, EntityMetadata, EntityType, SyncConflict};

use crate::engine::{SyncEngine, SyncStatus};
use crate::error::{SyncError, SyncResult};
use crate::exchange::ExchangeService;
use crate::inbound::Origin;
use crate::protocol::{
    ApplyStatus, ChecksumComparison, CompareRequest, HandshakeResponse, MerkleRequest, MerkleResponse,
    NegotiateRequest, NegotiateResponse, NodeInfo, PullRequest, PullResponse, PushOperation, PushRequest,
    PushResponse, RelayAckRequest, RelayAckResponse, RelayPullRequest, RelayPullResponse, RelayPushRequest,
    RelayPushResponse, ResolveConflictRequest, TriggerRequest, TriggerResponse, PROTOCOL_VERSION,
};
use crate::relay::RelayStore;

const DEFAULT_CONFLICT_LIMIT: i64 = 100;

// =============================================================================
// Server State
// =============================================================================

pub struct ServerState {
    engine: Arc<SyncEngine>,
    exchange: ExchangeService,
    relay: RelayStore,
}

impl ServerState {
    fn authenticate(&self, headers: &HeaderMap) -> SyncResult<String> {
        self.engine.auth().authenticate(headers)
    }
}

// =============================================================================
// Mesh Server
// =============================================================================

pub struct MeshServer {
    state: Arc<ServerState>,
}

/// Handle for a running server.
pub struct MeshServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl MeshServerHandle {
    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Stops accepting connections and waits for in-flight requests.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Mesh server task ended abnormally");
        }
    }
}

impl MeshServer {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        let config = engine.config().clone();
        let db = engine.db().clone();
        let state = ServerState {
            exchange: ExchangeService::new(db.clone(), config.clone()),
            relay: RelayStore::new(db, &config.relay),
            engine,
        };
        MeshServer {
            state: Arc::new(state),
        }
    }

    /// The route table for this node's role.
    pub fn router(&self) -> Router {
        let config = self.state.engine.config();

        let mut app = Router::new()
            .route("/health", get(health_handler))
            .route("/mesh/handshake", post(handshake_handler))
            .route("/api/relay/push", post(relay_push_handler))
            .route("/api/relay/pull", post(relay_pull_handler))
            .route("/api/relay/ack", post(relay_ack_handler));

        if !config.is_relay() {
            app = app
                .route("/api/mesh/nodes", get(nodes_handler))
                .route("/api/mesh/pull", post(pull_handler))
                .route("/api/mesh/push", post(push_handler))
                .route("/api/mesh/negotiate", post(negotiate_handler))
                .route("/api/mesh/merkle", post(merkle_handler))
                .route("/api/mesh/trigger", post(trigger_handler))
                .route("/api/sync/status", get(status_handler))
                .route("/api/sync/checksums/compare", post(compare_handler))
                .route("/api/sync/checksums/{entity_type}", get(checksums_handler))
                .route("/api/sync/checksums/{entity_type}/{entity_id}", get(checksum_handler))
                .route("/api/sync/conflicts", get(conflicts_handler))
                .route("/api/sync/conflicts/{id}/resolve", post(resolve_handler));
        }

        app.layer(DefaultBodyLimit::max(config.max_body_bytes()))
            .with_state(self.state.clone())
    }

    /// Binds `bind_address` and serves until the handle shuts it down.
    pub async fn start(self, bind_address: &str) -> SyncResult<MeshServerHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let app = self.router();

        let listener = TcpListener::bind(bind_address)
            .await
            .map_err(|e| SyncError::InvalidConfig(format!("Failed to bind to {}: {}", bind_address, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SyncError::Internal(format!("No local address: {}", e)))?;

        info!(
            addr = %local_addr,
            role = %self.state.engine.config().role.as_str(),
            "Mesh server started"
        );

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await;
                    info!("Mesh server shutting down");
                })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "Mesh server stopped with error");
            }
        });

        Ok(MeshServerHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn handshake_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(caller): Json<NodeInfo>,
) -> SyncResult<Json<HandshakeResponse>> {
    let caller_id = state.authenticate(&headers)?;
    if caller.instance_id != caller_id {
        return Err(SyncError::Forbidden(format!(
            "handshake for {} sent by {}",
            caller.instance_id, caller_id
        )));
    }
    state.engine.registry().register(caller).await;

    let mut node = state.engine.auth().node().clone();
    node.last_seen = Utc::now();
    Ok(Json(HandshakeResponse {
        node,
        protocol_version: PROTOCOL_VERSION,
        server_time: Utc::now(),
    }))
}

async fn nodes_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> SyncResult<Json<Vec<NodeInfo>>> {
    state.authenticate(&headers)?;
    Ok(Json(state.engine.registry().list().await))
}

async fn pull_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<PullRequest>,
) -> SyncResult<Json<PullResponse>> {
    let caller = state.authenticate(&headers)?;
    let response = state.exchange.pull(&request).await?;
    debug!(
        peer = %caller,
        types = request.entity_types.len(),
        records = response.total(),
        more = response.has_more(),
        "Served pull"
    );
    Ok(Json(response))
}

async fn push_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<PushRequest>,
) -> SyncResult<Json<PushResponse>> {
    let caller = state.authenticate(&headers)?;

    let entity_type = request.entity_type;
    if !state.engine.config().entity(entity_type).map(|e| e.enabled).unwrap_or(false) {
        return Err(SyncError::BadRequest(format!("{} is not synced by this node", entity_type)));
    }
    let tombstone = request.metadata.deleted;
    match request.operation {
        PushOperation::Delete if !tombstone => {
            return Err(SyncError::BadRequest("delete without tombstone metadata".into()));
        }
        PushOperation::Upsert if !tombstone && request.data.is_none() => {
            return Err(SyncError::BadRequest("upsert without data".into()));
        }
        _ => {}
    }

    let entity_id = request.entity_id.clone();
    let (entity_type, record) = request.into_record();
    let outcome = state
        .engine
        .applier()
        .apply_remote(entity_type, record, &Origin::push(caller.clone()))
        .await?;

    debug!(
        peer = %caller,
        entity_type = %entity_type,
        entity_id = %entity_id,
        status = %outcome.status,
        "Served push"
    );

    if outcome.status == ApplyStatus::IntegrityViolation {
        return Err(SyncError::IntegrityViolation {
            entity_type: entity_type.to_string(),
            entity_id,
            reason: outcome.reason,
        });
    }
    Ok(Json(PushResponse {
        status: outcome.status,
        reason: outcome.reason,
        version: outcome.version,
    }))
}

async fn negotiate_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<NegotiateRequest>,
) -> SyncResult<Json<NegotiateResponse>> {
    state.authenticate(&headers)?;
    Ok(Json(state.exchange.negotiate(&request).await?))
}

async fn merkle_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<MerkleRequest>,
) -> SyncResult<Json<MerkleResponse>> {
    state.authenticate(&headers)?;
    Ok(Json(state.exchange.merkle(&request).await?))
}

async fn trigger_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<TriggerRequest>,
) -> SyncResult<Json<TriggerResponse>> {
    let caller = state.authenticate(&headers)?;
    info!(peer = %caller, full = request.full, "Sync triggered remotely");
    Ok(Json(state.engine.trigger_sync(request)))
}

async fn status_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> SyncResult<Json<SyncStatus>> {
    state.authenticate(&headers)?;
    Ok(Json(state.engine.status().await))
}

fn parse_entity_type(raw: &str) -> SyncResult<EntityType> {
    Ok(raw.parse::<EntityType>()?)
}

async fn checksums_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(entity_type): Path<String>,
) -> SyncResult<Json<Vec<ChecksumEntity>>> {
    state.authenticate(&headers)?;
    let entity_type = parse_entity_type(&entity_type)?;
    Ok(Json(state.exchange.checksums(entity_type).await?))
}

async fn checksum_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> SyncResult<Json<ChecksumEntity>> {
    state.authenticate(&headers)?;
    let entity_type = parse_entity_type(&entity_type)?;
    Ok(Json(state.exchange.checksum(entity_type, &entity_id).await?))
}

async fn compare_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<CompareRequest>,
) -> SyncResult<Json<Vec<ChecksumComparison>>> {
    state.authenticate(&headers)?;
    Ok(Json(state.exchange.compare(&request).await?))
}

#[derive(Debug, Deserialize)]
struct ConflictQuery {
    limit: Option<i64>,
}

async fn conflicts_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(query): Query<ConflictQuery>,
) -> SyncResult<Json<Vec<SyncConflict>>> {
    state.authenticate(&headers)?;
    let limit = query.limit.unwrap_or(DEFAULT_CONFLICT_LIMIT).clamp(1, 1000);
    Ok(Json(
        state.engine.db().conflicts().list(ConflictStatus::Pending, limit).await?,
    ))
}

async fn resolve_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<ResolveConflictRequest>,
) -> SyncResult<Json<EntityMetadata>> {
    let caller = state.authenticate(&headers)?;
    let resolved_by = request.resolved_by.unwrap_or(caller);
    let meta = state
        .engine
        .applier()
        .resolve_manually(&id, request.winner, &resolved_by)
        .await?;
    info!(conflict_id = %id, resolved_by = %resolved_by, "Conflict resolved manually");
    Ok(Json(meta))
}

// =============================================================================
// Relay Handlers
// =============================================================================

async fn relay_push_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<RelayPushRequest>,
) -> SyncResult<Json<RelayPushResponse>> {
    let sender = state.authenticate(&headers)?;
    Ok(Json(state.relay.accept(&sender, request).await?))
}

async fn relay_pull_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<RelayPullRequest>,
) -> SyncResult<Json<RelayPullResponse>> {
    let recipient = state.authenticate(&headers)?;
    let packets = state.relay.fetch(&recipient, request.limit).await?;
    Ok(Json(RelayPullResponse { packets }))
}

async fn relay_ack_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<RelayAckRequest>,
) -> SyncResult<Json<RelayAckResponse>> {
    let recipient = state.authenticate(&headers)?;
    let removed = state.relay.ack(&recipient, &request.ids).await?;
    Ok(Json(RelayAckResponse { removed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stockmesh_core::{NodeRole, TruthSource};
    use stockmesh_db::{Database, DbConfig};

    use crate::auth::MeshAuth;
    use crate::config::SyncConfig;
    use crate::interceptor::WriteContext;
    use crate::transport::{MeshTransport, TransportConfig};

    async fn node(id: &str, role: NodeRole) -> (Arc<SyncEngine>, MeshServerHandle) {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let mut config = SyncConfig::default();
        config.node.instance_id = id.into();
        config.node.mesh_secret = "secret".into();
        config.role = role;
        let engine = Arc::new(SyncEngine::new(config, db).await.unwrap());
        let server = MeshServer::new(engine.clone()).start("127.0.0.1:0").await.unwrap();
        (engine, server)
    }

    fn client(id: &str, secret: &str, base: &str) -> MeshTransport {
        let auth = MeshAuth::new(
            secret,
            NodeInfo {
                instance_id: id.into(),
                role: NodeRole::Peer,
                base_url: None,
                weight: 50,
                is_online: true,
                last_seen: Utc::now(),
            },
        );
        let config = TransportConfig {
            max_retries: 1,
            ..TransportConfig::default()
        };
        MeshTransport::new(base, Arc::new(auth), config).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_registers_peer() {
        let (engine, server) = node("nodeA", NodeRole::Peer).await;
        let transport = client("nodeB", "secret", &server.base_url());

        assert!(transport.health().await);
        let response = transport.handshake(&NodeInfo {
            instance_id: "nodeB".into(),
            role: NodeRole::Peer,
            base_url: None,
            weight: 50,
            is_online: true,
            last_seen: Utc::now(),
        })
        .await
        .unwrap();
        assert_eq!(response.node.instance_id, "nodeA");
        assert_eq!(response.protocol_version, PROTOCOL_VERSION);

        let peers = transport.nodes().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].instance_id, "nodeB");
        assert!(engine.registry().get("nodeB").await.is_some());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let (_engine, server) = node("nodeA", NodeRole::Peer).await;
        let transport = client("nodeB", "not-the-secret", &server.base_url());

        let err = transport.pull(&PullRequest::since(EntityType::Tracking, None)).await.unwrap_err();
        assert!(err.is_auth_error());
        assert!(!err.is_retryable());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_pull_and_push_over_http() {
        let (engine, server) = node("nodeA", NodeRole::Peer).await;
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
        let transport = client("nodeB", "secret", &server.base_url());

        let mut pulled = transport
            .pull(&PullRequest::since(EntityType::Tracking, None))
            .await
            .unwrap();
        let records = pulled.take(EntityType::Tracking);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data.as_ref().unwrap()["status"], "in_transit");

        // Echo the same version back: nothing changes.
        let record = records.into_iter().next().unwrap();
        let response = transport
            .push(&PushRequest {
                entity_type: EntityType::Tracking,
                entity_id: record.entity_id.clone(),
                operation: PushOperation::Upsert,
                data: record.data.clone(),
                metadata: record.metadata.clone(),
                artifacts: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(response.status, ApplyStatus::Unchanged);

        // Upsert without data is rejected as a client error.
        let err = transport
            .push(&PushRequest {
                entity_type: EntityType::Tracking,
                entity_id: record.entity_id,
                operation: PushOperation::Upsert,
                data: None,
                metadata: record.metadata,
                artifacts: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::HttpStatus { status: 400, .. }));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_relay_mounts_only_relay_routes() {
        let (_engine, server) = node("relay1", NodeRole::BlindRelay).await;
        let transport = client("nodeB", "secret", &server.base_url());

        let err = transport
            .pull(&PullRequest::since(EntityType::Tracking, None))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::HttpStatus { status: 404, .. }));

        let fetched = transport.relay_pull(None).await.unwrap();
        assert!(fetched.packets.is_empty());
        server.shutdown().await;
    }
}
