//! End-to-end tests: real engines talking to real mesh servers over
//! loopback HTTP.

use std::sync::Arc;

use serde_json::json;
use stockmesh_core::{ConflictStatus, EntityType, NodeRole, RouteType, TruthSource};
use stockmesh_db::{Database, DbConfig};
use stockmesh_sync::{
    MeshServer, MeshServerHandle, RouteConfig, SyncConfig, SyncEngine, WriteContext,
};

const SECRET: &str = "integration-secret";
const NETWORK_KEY: &str = "0707070707070707070707070707070707070707070707070707070707070707";

struct Node {
    engine: Arc<SyncEngine>,
    server: MeshServerHandle,
}

impl Node {
    fn url(&self) -> String {
        self.server.base_url()
    }

    fn db(&self) -> &Arc<Database> {
        self.engine.db()
    }

    async fn shutdown(self) {
        self.server.shutdown().await;
    }
}

fn base_config(id: &str) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.node.instance_id = id.into();
    config.node.mesh_secret = SECRET.into();
    config.transport.max_retries = 1;
    config.transport.parallel_sync = false;
    config
}

async fn spawn_node(config: SyncConfig) -> Node {
    let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
    let engine = Arc::new(SyncEngine::new(config, db).await.unwrap());
    let server = MeshServer::new(engine.clone()).start("127.0.0.1:0").await.unwrap();
    Node { engine, server }
}

fn route_to(node: &Node) -> RouteConfig {
    RouteConfig::new(node.url(), RouteType::Primary, 5, 1)
}

fn local() -> WriteContext {
    WriteContext::new(TruthSource::Local)
}

#[tokio::test]
async fn test_new_tracking_reaches_peer_with_origin_clock() {
    let a = spawn_node(base_config("nodeA")).await;
    let mut config_b = base_config("nodeB");
    config_b.routes = vec![route_to(&a)];
    let b = spawn_node(config_b).await;

    let payload = json!({"status": "in_transit", "updated_at": "2026-10-16T08:00:00Z"});
    a.engine
        .interceptor()
        .upsert(EntityType::Tracking, "TEST-1", &payload, &local())
        .await
        .unwrap();

    let summary = b.engine.sync_now(&[EntityType::Tracking], false).await.unwrap();
    assert!(summary.is_clean(), "errors: {:?}", summary.errors);
    assert_eq!(summary.pulled, 1);

    let record = b.db().records().get(EntityType::Tracking, "TEST-1").await.unwrap().unwrap();
    assert_eq!(record.data["status"], "in_transit");
    assert_eq!(record.data["updated_at"], "2026-10-16T08:00:00Z");

    let meta = b.db().metadata().get(EntityType::Tracking, "TEST-1").await.unwrap().unwrap();
    assert_eq!(meta.vector_clock.get("nodeA"), 1);
    assert_eq!(meta.vector_clock.get("nodeB"), 0);
    assert_eq!(meta.instance_id, "nodeA");

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_resync_is_idempotent_and_picks_up_later_writes() {
    let a = spawn_node(base_config("nodeA")).await;
    let mut config_b = base_config("nodeB");
    config_b.routes = vec![route_to(&a)];
    let b = spawn_node(config_b).await;
    let route_id = route_to(&a).id();

    a.engine
        .interceptor()
        .upsert(EntityType::Tracking, "TEST-1", &json!({"status": "packed"}), &local())
        .await
        .unwrap();
    b.engine.sync_now(&[EntityType::Tracking], false).await.unwrap();
    let first = b.db().metadata().get(EntityType::Tracking, "TEST-1").await.unwrap().unwrap();
    assert!(b.db().watermarks().since(&route_id, EntityType::Tracking).await.unwrap().is_some());

    // Nothing new on A: nothing changes on B.
    let again = b.engine.sync_now(&[EntityType::Tracking], false).await.unwrap();
    assert_eq!(again.pulled, 0);
    let second = b.db().metadata().get(EntityType::Tracking, "TEST-1").await.unwrap().unwrap();
    assert_eq!(first.version, second.version);
    assert_eq!(first.vector_clock, second.vector_clock);

    // A later write on A arrives through the incremental path.
    a.engine
        .interceptor()
        .upsert(EntityType::Tracking, "TEST-1", &json!({"status": "shipped"}), &local())
        .await
        .unwrap();
    a.engine
        .interceptor()
        .upsert(EntityType::Tracking, "TEST-2", &json!({"status": "packed"}), &local())
        .await
        .unwrap();
    let summary = b.engine.sync_now(&[EntityType::Tracking], false).await.unwrap();
    assert_eq!(summary.pulled, 2);

    let updated = b.db().records().get(EntityType::Tracking, "TEST-1").await.unwrap().unwrap();
    assert_eq!(updated.data["status"], "shipped");
    assert!(b.db().records().get(EntityType::Tracking, "TEST-2").await.unwrap().is_some());

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_local_write_is_pushed_and_delete_propagates() {
    let a = spawn_node(base_config("nodeA")).await;
    let mut config_b = base_config("nodeB");
    config_b.routes = vec![route_to(&a)];
    let b = spawn_node(config_b).await;

    b.engine
        .interceptor()
        .upsert(EntityType::Location, "Shelf C", &json!({"usage": 4}), &local())
        .await
        .unwrap();
    let summary = b.engine.sync_now(&[EntityType::Location], false).await.unwrap();
    assert_eq!(summary.pushed, 1);
    assert_eq!(b.db().queue().count_pending().await.unwrap(), 0);

    let on_a = a.db().records().get(EntityType::Location, "Shelf C").await.unwrap().unwrap();
    assert_eq!(on_a.data["usage"], 4);

    a.engine
        .interceptor()
        .delete(EntityType::Location, "Shelf C", &local())
        .await
        .unwrap();
    b.engine.sync_now(&[EntityType::Location], false).await.unwrap();

    let meta = b.db().metadata().get(EntityType::Location, "Shelf C").await.unwrap().unwrap();
    assert!(meta.deleted);
    assert!(b.db().records().get(EntityType::Location, "Shelf C").await.unwrap().is_none());

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_shelf_update_converges_on_physical_scan() {
    let a = spawn_node(base_config("nodeA")).await;
    let mut config_b = base_config("nodeB");
    config_b.routes = vec![route_to(&a)];
    let b = spawn_node(config_b).await;
    let shelf = "Shelf A";

    // Common ancestor {nodeA:2} on both nodes.
    for usage in [10, 20] {
        a.engine
            .interceptor()
            .upsert(EntityType::Location, shelf, &json!({"usage": usage}), &local())
            .await
            .unwrap();
    }
    b.engine.sync_now(&[EntityType::Location], false).await.unwrap();

    // Concurrent edits: a scan on A, a desk edit on B.
    a.engine
        .interceptor()
        .upsert(
            EntityType::Location,
            shelf,
            &json!({"usage": 30}),
            &WriteContext::new(TruthSource::Physical),
        )
        .await
        .unwrap();
    b.engine
        .interceptor()
        .upsert(EntityType::Location, shelf, &json!({"usage": 25}), &local())
        .await
        .unwrap();

    let summary = b.engine.sync_now(&[EntityType::Location], false).await.unwrap();
    assert!(summary.conflicts_detected >= 1);

    let on_a = a.db().records().get(EntityType::Location, shelf).await.unwrap().unwrap();
    let on_b = b.db().records().get(EntityType::Location, shelf).await.unwrap().unwrap();
    assert_eq!(on_a.data["usage"], 30);
    assert_eq!(on_b.data["usage"], 30);

    let meta_b = b.db().metadata().get(EntityType::Location, shelf).await.unwrap().unwrap();
    assert_eq!(meta_b.vector_clock.get("nodeA"), 3);
    assert_eq!(meta_b.vector_clock.get("nodeB"), 1);

    let conflicts = b.db().conflicts().for_entity(EntityType::Location, shelf).await.unwrap();
    assert!(!conflicts.is_empty());
    assert!(conflicts.iter().all(|c| c.status == ConflictStatus::Resolved));
    assert_eq!(conflicts[0].local_data.as_ref().unwrap()["usage"], 25);

    // The winning side keeps the same artifact, seen from its end.
    let on_a = a.db().conflicts().for_entity(EntityType::Location, shelf).await.unwrap();
    assert!(!on_a.is_empty());
    assert!(on_a.iter().all(|c| c.status == ConflictStatus::Resolved));
    assert!(on_a
        .iter()
        .all(|c| c.local_data.as_ref().unwrap()["usage"] == 30
            && c.remote_data.as_ref().unwrap()["usage"] == 25));

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_cycle_syncs_every_usable_route() {
    let a = spawn_node(base_config("nodeA")).await;
    let b = spawn_node(base_config("nodeB")).await;
    let mut config_c = base_config("nodeC");
    config_c.routes = vec![
        RouteConfig::new(a.url(), RouteType::Primary, 5, 1),
        RouteConfig::new(b.url(), RouteType::Web, 5, 2),
    ];
    let c = spawn_node(config_c).await;

    b.engine
        .interceptor()
        .upsert(EntityType::Location, "Shelf B", &json!({"usage": 7}), &local())
        .await
        .unwrap();
    c.engine
        .interceptor()
        .upsert(EntityType::Location, "Shelf C", &json!({"usage": 3}), &local())
        .await
        .unwrap();

    let summary = c.engine.sync_now(&[EntityType::Location], false).await.unwrap();
    assert!(summary.is_clean(), "errors: {:?}", summary.errors);
    assert_eq!(summary.routes.len(), 2);

    // Written on the lower priority peer, still pulled.
    let from_b = c.db().records().get(EntityType::Location, "Shelf B").await.unwrap().unwrap();
    assert_eq!(from_b.data["usage"], 7);

    // The local write reached both peers before its queue entry closed.
    assert!(a.db().records().get(EntityType::Location, "Shelf C").await.unwrap().is_some());
    assert!(b.db().records().get(EntityType::Location, "Shelf C").await.unwrap().is_some());
    assert_eq!(c.db().queue().count_pending().await.unwrap(), 0);

    c.shutdown().await;
    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_blind_relay_round_trip() {
    let mut relay_config = base_config("relay1");
    relay_config.role = NodeRole::BlindRelay;
    let relay = spawn_node(relay_config).await;

    let relay_client_config = |id: &str, recipient: &str| {
        let mut config = base_config(id);
        config.relay.url = Some(relay.url());
        config.relay.network_key = Some(NETWORK_KEY.into());
        config.relay.recipients = vec![recipient.to_string()];
        config
    };
    let a = spawn_node(relay_client_config("nodeA", "nodeB")).await;
    let b = spawn_node(relay_client_config("nodeB", "nodeA")).await;

    a.engine
        .interceptor()
        .upsert(EntityType::Tracking, "TEST-1", &json!({"status": "in_transit"}), &local())
        .await
        .unwrap();

    let sent = a.engine.relay_client().unwrap().run_once().await.unwrap();
    assert_eq!(sent.sealed, 1);
    assert_eq!(sent.accepted, 1);

    // The relay holds ciphertext and nothing else.
    assert_eq!(relay.db().relay_packets().count_for("nodeB").await.unwrap(), 1);
    assert!(relay.db().records().get(EntityType::Tracking, "TEST-1").await.unwrap().is_none());

    let received = b.engine.relay_client().unwrap().run_once().await.unwrap();
    assert_eq!(received.received, 1);
    assert_eq!(received.applied, 1);
    assert_eq!(relay.db().relay_packets().count_for("nodeB").await.unwrap(), 0);

    let record = b.db().records().get(EntityType::Tracking, "TEST-1").await.unwrap().unwrap();
    assert_eq!(record.data["status"], "in_transit");

    a.shutdown().await;
    b.shutdown().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn test_relay_rejection_holds_forward_cursor() {
    let mut relay_config = base_config("relay1");
    relay_config.role = NodeRole::BlindRelay;
    relay_config.relay.max_packet_bytes = 16;
    let relay = spawn_node(relay_config).await;

    let mut config_a = base_config("nodeA");
    config_a.relay.url = Some(relay.url());
    config_a.relay.network_key = Some(NETWORK_KEY.into());
    config_a.relay.recipients = vec!["nodeB".to_string()];
    let a = spawn_node(config_a).await;

    a.engine
        .interceptor()
        .upsert(EntityType::Tracking, "TEST-1", &json!({"status": "in_transit"}), &local())
        .await
        .unwrap();

    let client = a.engine.relay_client().unwrap();
    let first = client.run_once().await.unwrap();
    assert_eq!(first.sealed, 1);
    assert_eq!(first.rejected, 1);
    assert_eq!(relay.db().relay_packets().count_for("nodeB").await.unwrap(), 0);

    // Nothing was stored, so the same change is sealed again.
    let second = client.run_once().await.unwrap();
    assert_eq!(second.sealed, 1);
    assert_eq!(second.rejected, 1);
    assert!(a
        .db()
        .watermarks()
        .since(client.route_id(), EntityType::Tracking)
        .await
        .unwrap()
        .is_none());

    a.shutdown().await;
    relay.shutdown().await;
}
