//! Known peers of this node, filled by incoming handshakes.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::protocol::NodeInfo;

/// Peers are reported offline after this long without a handshake.
pub const PEER_STALE_AFTER_SECS: i64 = 300;

/// Owned by the engine and shared with the server through `Arc`.
pub struct PeerRegistry {
    self_id: String,
    peers: RwLock<HashMap<String, NodeInfo>>,
}

impl PeerRegistry {
    pub fn new(self_id: impl Into<String>) -> Self {
        PeerRegistry {
            self_id: self_id.into(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Records a handshake. Returns `true` the first time a peer is seen.
    pub async fn register(&self, mut info: NodeInfo) -> bool {
        if info.instance_id == self.self_id {
            return false;
        }
        info.is_online = true;
        info.last_seen = Utc::now();

        let mut peers = self.peers.write().await;
        let is_new = !peers.contains_key(&info.instance_id);
        if is_new {
            info!(peer = %info.instance_id, role = %info.role.as_str(), "Peer registered");
        } else {
            debug!(peer = %info.instance_id, "Peer refreshed");
        }
        peers.insert(info.instance_id.clone(), info);
        is_new
    }

    pub async fn get(&self, instance_id: &str) -> Option<NodeInfo> {
        self.peers.read().await.get(instance_id).cloned()
    }

    /// All peers except this node, sorted by instance id. Peers silent for
    /// longer than [`PEER_STALE_AFTER_SECS`] are reported offline.
    pub async fn list(&self) -> Vec<NodeInfo> {
        self.list_at(Utc::now()).await
    }

    async fn list_at(&self, now: DateTime<Utc>) -> Vec<NodeInfo> {
        let stale_before = now - Duration::seconds(PEER_STALE_AFTER_SECS);
        let mut list: Vec<NodeInfo> = self
            .peers
            .read()
            .await
            .values()
            .map(|p| {
                let mut p = p.clone();
                p.is_online = p.is_online && p.last_seen >= stale_before;
                p
            })
            .collect();
        list.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        list
    }

    pub async fn mark_offline(&self, instance_id: &str) {
        if let Some(peer) = self.peers.write().await.get_mut(instance_id) {
            peer.is_online = false;
        }
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }
}
