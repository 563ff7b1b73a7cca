//! # Blind Relay
//!
//! Store-and-forward for peers that cannot reach each other directly.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   nodeA (NAT)                 relay                  nodeB (NAT)        │
//! │  ┌────────────┐         ┌──────────────┐         ┌────────────┐        │
//! │  │RelayClient │ seal    │  RelayStore  │  pull   │RelayClient │        │
//! │  │ changes ───┼────────►│  sender,     │◄────────┼── poll     │        │
//! │  │ since      │ push    │  recipient,  │ packets │ open       │        │
//! │  │ cursor     │         │  ciphertext  │────────►│ apply      │        │
//! │  └────────────┘         │  (no key)    │◄────────┼── ack      │        │
//! │                         └──────────────┘         └────────────┘        │
//! │                                                                         │
//! │  AES-256-GCM, random 96-bit nonce. AAD binds                           │
//! │  sender | recipient | entity_type | entity_id | version                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The relay never holds the network key. It logs ids, sizes and counts,
//! never payloads.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use stockmesh_core::{EncryptedPacket, EntityType};
use stockmesh_db::{ChangeQuery, Database};

use crate::config::{RelaySettings, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::inbound::{InboundApplier, Origin};
use crate::protocol::{
    PushOperation, PushRequest, RelayEnvelope, RelayPushRequest, RelayPushResponse, RelayRejection,
};
use crate::transport::MeshTransport;

const NONCE_LEN: usize = 12;
const DEFAULT_FETCH_LIMIT: i64 = 100;
const MAX_FETCH_LIMIT: i64 = 500;

// =============================================================================
// Security Layer
// =============================================================================

/// End-to-end envelope encryption with the shared network key.
pub struct SecurityLayer {
    instance_id: String,
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecurityLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityLayer")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl SecurityLayer {
    pub fn from_key(instance_id: impl Into<String>, key: &[u8; 32]) -> SyncResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| SyncError::InvalidConfig(format!("bad network key: {}", e)))?;
        Ok(SecurityLayer {
            instance_id: instance_id.into(),
            cipher,
        })
    }

    /// Builds the layer from config. `Ok(None)` when no network key is set.
    /// A blind relay never gets one.
    pub fn from_config(config: &SyncConfig) -> SyncResult<Option<Self>> {
        if config.is_relay() {
            return Err(SyncError::RoleMismatch {
                role: config.role.as_str().to_string(),
                operation: "envelope encryption".into(),
            });
        }
        match config.relay.network_key_bytes()? {
            Some(key) => Self::from_key(config.instance_id(), &key).map(Some),
            None => Ok(None),
        }
    }

    /// Encrypts one change for `recipient`.
    pub fn seal(&self, recipient: &str, change: &PushRequest) -> SyncResult<RelayEnvelope> {
        let plaintext = serde_json::to_vec(change)?;
        let version = change.metadata.version;
        let aad = associated_data(&self.instance_id, recipient, change.entity_type, &change.entity_id, version);

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| SyncError::EncryptionFailed(format!("{}/{}", change.entity_type, change.entity_id)))?;

        Ok(RelayEnvelope {
            id: Uuid::new_v4().to_string(),
            sender_id: self.instance_id.clone(),
            recipient_id: recipient.to_string(),
            entity_type: change.entity_type,
            entity_id: change.entity_id.clone(),
            version,
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    /// Decrypts a packet addressed to this node.
    pub fn open(&self, packet: &EncryptedPacket) -> SyncResult<PushRequest> {
        if packet.recipient_id != self.instance_id {
            return Err(SyncError::DecryptionFailed(format!(
                "packet {} is addressed to {}",
                packet.id, packet.recipient_id
            )));
        }

        let nonce_bytes = BASE64
            .decode(&packet.nonce)
            .map_err(|e| SyncError::DecryptionFailed(format!("nonce: {}", e)))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(SyncError::DecryptionFailed("nonce must be 12 bytes".into()));
        }
        let ciphertext = BASE64
            .decode(&packet.ciphertext)
            .map_err(|e| SyncError::DecryptionFailed(format!("ciphertext: {}", e)))?;

        let aad = associated_data(
            &packet.sender_id,
            &packet.recipient_id,
            packet.entity_type,
            &packet.entity_id,
            packet.version,
        );
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| SyncError::DecryptionFailed(format!("packet {} failed authentication", packet.id)))?;

        let change: PushRequest = serde_json::from_slice(&plaintext)?;
        if change.entity_type != packet.entity_type
            || change.entity_id != packet.entity_id
            || change.metadata.version != packet.version
        {
            return Err(SyncError::DecryptionFailed(format!(
                "packet {} header does not match its payload",
                packet.id
            )));
        }
        Ok(change)
    }
}

fn associated_data(sender: &str, recipient: &str, entity_type: EntityType, entity_id: &str, version: i64) -> Vec<u8> {
    format!("{}|{}|{}|{}|{}", sender, recipient, entity_type, entity_id, version).into_bytes()
}

// =============================================================================
// Relay Store (server side)
// =============================================================================

/// Durable envelope queue keyed by recipient.
pub struct RelayStore {
    db: Arc<Database>,
    max_packet_bytes: usize,
    ttl: Duration,
}

impl RelayStore {
    pub fn new(db: Arc<Database>, settings: &RelaySettings) -> Self {
        RelayStore {
            db,
            max_packet_bytes: settings.max_packet_bytes,
            ttl: Duration::hours(settings.packet_ttl_hours),
        }
    }

    /// Stores envelopes pushed by `sender`. Invalid envelopes are rejected
    /// one by one; the rest are kept.
    pub async fn accept(&self, sender: &str, request: RelayPushRequest) -> SyncResult<RelayPushResponse> {
        let now = Utc::now();
        let mut response = RelayPushResponse::default();

        for envelope in request.envelopes {
            if let Err(e) = self.validate(sender, &envelope) {
                debug!(packet_id = %envelope.id, sender = %sender, error = %e, "Envelope rejected");
                response.rejected.push(RelayRejection {
                    id: envelope.id,
                    reason: e.to_string(),
                });
                continue;
            }

            let packet = EncryptedPacket {
                id: envelope.id,
                sender_id: envelope.sender_id,
                recipient_id: envelope.recipient_id,
                entity_type: envelope.entity_type,
                entity_id: envelope.entity_id,
                version: envelope.version,
                nonce: envelope.nonce,
                ciphertext: envelope.ciphertext,
                created_at: now,
                expires_at: now + self.ttl,
                forwarded_at: None,
            };

            match self.db.relay_packets().insert(&packet).await {
                Ok(()) => response.accepted.push(packet.id),
                Err(e) => {
                    warn!(packet_id = %packet.id, error = %e, "Failed to store envelope");
                    response.rejected.push(RelayRejection {
                        id: packet.id,
                        reason: "storage failure".into(),
                    });
                }
            }
        }

        info!(
            sender = %sender,
            accepted = response.accepted.len(),
            rejected = response.rejected.len(),
            "Relay push handled"
        );
        Ok(response)
    }

    fn validate(&self, sender: &str, envelope: &RelayEnvelope) -> SyncResult<()> {
        if envelope.sender_id != sender {
            return Err(SyncError::Forbidden(format!(
                "envelope sender {} is not the caller",
                envelope.sender_id
            )));
        }
        if envelope.id.is_empty() || envelope.recipient_id.is_empty() {
            return Err(SyncError::BadRequest("envelope id and recipient are required".into()));
        }
        if envelope.recipient_id == sender {
            return Err(SyncError::BadRequest("envelope addressed to its sender".into()));
        }
        let size = envelope.ciphertext.len() + envelope.nonce.len();
        if size > self.max_packet_bytes {
            return Err(SyncError::PacketTooLarge {
                size,
                max: self.max_packet_bytes,
            });
        }
        Ok(())
    }

    /// Undelivered envelopes for `recipient`, stamped as forwarded.
    pub async fn fetch(&self, recipient: &str, limit: Option<i64>) -> SyncResult<Vec<EncryptedPacket>> {
        let limit = limit.unwrap_or(DEFAULT_FETCH_LIMIT).clamp(1, MAX_FETCH_LIMIT);
        let packets = self.db.relay_packets().fetch_for(recipient, limit, Utc::now()).await?;
        debug!(recipient = %recipient, count = packets.len(), "Relay packets fetched");
        Ok(packets)
    }

    pub async fn ack(&self, recipient: &str, ids: &[String]) -> SyncResult<u64> {
        let removed = self.db.relay_packets().ack(recipient, ids).await?;
        debug!(recipient = %recipient, removed, "Relay packets acknowledged");
        Ok(removed)
    }

    pub async fn purge_expired(&self) -> SyncResult<u64> {
        let purged = self.db.relay_packets().purge_expired(Utc::now()).await?;
        if purged > 0 {
            info!(purged, "Expired relay packets purged");
        }
        Ok(purged)
    }
}

// =============================================================================
// Relay Client (peer side)
// =============================================================================

/// Counts for one relay exchange.
#[derive(Debug, Clone, Default)]
pub struct RelayReport {
    pub sealed: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub received: usize,
    pub applied: usize,
    pub undecryptable: usize,
    pub failed: usize,
}

/// Forwards local changes through a relay and applies what the relay holds
/// for this node.
pub struct RelayClient {
    db: Arc<Database>,
    config: Arc<SyncConfig>,
    transport: MeshTransport,
    security: SecurityLayer,
    applier: Arc<InboundApplier>,
    route_id: String,
    /// Keyset cursor per type. Seeded from the stored watermark.
    cursors: Mutex<HashMap<EntityType, (DateTime<Utc>, String)>>,
}

impl RelayClient {
    pub fn new(
        db: Arc<Database>,
        config: Arc<SyncConfig>,
        transport: MeshTransport,
        security: SecurityLayer,
        applier: Arc<InboundApplier>,
    ) -> Self {
        let route_id = format!("relay:{}", transport.base_url());
        RelayClient {
            db,
            config,
            transport,
            security,
            applier,
            route_id,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    /// Forward then receive.
    pub async fn run_once(&self) -> SyncResult<RelayReport> {
        let mut report = RelayReport::default();
        if !self.config.relay.recipients.is_empty() && self.config.direction.pushes() {
            self.forward_changes(&mut report).await?;
        }
        if self.config.direction.pulls() {
            self.receive(&mut report).await?;
        }
        Ok(report)
    }

    /// Seals every change since the last forward for each recipient.
    pub async fn forward_changes(&self, report: &mut RelayReport) -> SyncResult<()> {
        let limit = self.config.transport.batch_size.max(1) as i64;

        for entity_type in self.config.enabled_entity_types() {
            let mut cursor = self.cursor(entity_type).await?;

            loop {
                let query = ChangeQuery {
                    since: cursor.as_ref().map(|(ts, _)| *ts),
                    after_id: cursor.as_ref().map(|(_, id)| id.as_str()),
                    limit,
                    active_only: false,
                };
                let changes = self.db.metadata().changed_since(entity_type, &query).await?;
                let page_len = changes.len();
                let Some(page_end) = changes.last().map(|m| m.entity_id.clone()) else {
                    break;
                };

                // Envelope ids per change, in page order.
                let mut sealed: Vec<((DateTime<Utc>, String), Vec<String>)> = Vec::with_capacity(page_len);
                let mut envelopes = Vec::new();
                for meta in changes {
                    let position = (meta.modified_at, meta.entity_id.clone());
                    let data = if meta.deleted {
                        None
                    } else {
                        self.db
                            .records()
                            .get(entity_type, &meta.entity_id)
                            .await?
                            .map(|r| r.data)
                    };
                    let artifacts = self.db.conflicts().carried_by(&meta).await?;
                    let change = PushRequest {
                        entity_type,
                        entity_id: meta.entity_id.clone(),
                        operation: if meta.deleted {
                            PushOperation::Delete
                        } else {
                            PushOperation::Upsert
                        },
                        data,
                        metadata: meta,
                        artifacts,
                    };
                    let mut ids = Vec::new();
                    for recipient in &self.config.relay.recipients {
                        // Never echo a change back to the node that wrote it.
                        if *recipient == change.metadata.instance_id {
                            continue;
                        }
                        let envelope = self.security.seal(recipient, &change)?;
                        ids.push(envelope.id.clone());
                        envelopes.push(envelope);
                    }
                    sealed.push((position, ids));
                }

                report.sealed += envelopes.len();
                let mut rejected = HashSet::new();
                if !envelopes.is_empty() {
                    let response = self.transport.relay_push(&RelayPushRequest { envelopes }).await?;
                    report.accepted += response.accepted.len();
                    report.rejected += response.rejected.len();
                    for rejection in response.rejected {
                        warn!(packet_id = %rejection.id, reason = %rejection.reason, "Relay rejected envelope");
                        rejected.insert(rejection.id);
                    }
                }

                // The cursor stops before the first change the relay did not
                // store, so the next run seals it again.
                let mut reached = None;
                let mut held = false;
                for (position, ids) in sealed {
                    if ids.iter().any(|id| rejected.contains(id)) {
                        held = true;
                        break;
                    }
                    reached = Some(position);
                }
                if held {
                    debug!(
                        entity_type = %entity_type,
                        page_end = %page_end,
                        "Relay forward held at a rejected change"
                    );
                }

                if let Some(position) = reached {
                    let mut tx = self.db.begin().await?;
                    self.db
                        .watermarks()
                        .advance_in(&mut tx, &self.route_id, entity_type, position.0)
                        .await?;
                    tx.commit().await?;
                    cursor = Some(position);
                }

                if held || page_len < limit as usize {
                    break;
                }
            }

            if let Some(cursor) = cursor {
                self.cursors.lock().await.insert(entity_type, cursor);
            }
        }
        Ok(())
    }

    async fn cursor(&self, entity_type: EntityType) -> SyncResult<Option<(DateTime<Utc>, String)>> {
        if let Some(cursor) = self.cursors.lock().await.get(&entity_type) {
            return Ok(Some(cursor.clone()));
        }
        // After a restart only the timestamp survives; records at exactly
        // that instant are sent once more and applied as no-ops.
        let since = self.db.watermarks().since(&self.route_id, entity_type).await?;
        Ok(since.map(|ts| (ts, String::new())))
    }

    /// Pulls, opens and applies envelopes addressed to this node, then acks
    /// the ones that are done with.
    pub async fn receive(&self, report: &mut RelayReport) -> SyncResult<()> {
        let limit = self.config.transport.batch_size.max(1) as i64;
        let packets = self.transport.relay_pull(Some(limit)).await?.packets;
        report.received += packets.len();

        let mut done = Vec::with_capacity(packets.len());
        for packet in packets {
            let change = match self.security.open(&packet) {
                Ok(change) => change,
                Err(e) => {
                    // Undecryptable now means undecryptable forever.
                    warn!(packet_id = %packet.id, sender = %packet.sender_id, error = %e, "Dropping relay packet");
                    report.undecryptable += 1;
                    done.push(packet.id);
                    continue;
                }
            };

            let (entity_type, record) = change.into_record();
            match self
                .applier
                .apply_remote(entity_type, record, &Origin::push(packet.sender_id.clone()))
                .await
            {
                Ok(outcome) => {
                    debug!(
                        packet_id = %packet.id,
                        entity_type = %entity_type,
                        status = outcome.status.as_str(),
                        "Relay change applied"
                    );
                    report.applied += 1;
                    done.push(packet.id);
                }
                Err(e) => {
                    warn!(packet_id = %packet.id, error = %e, "Failed to apply relay change");
                    report.failed += 1;
                }
            }
        }

        if !done.is_empty() {
            self.transport.relay_ack(done).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stockmesh_core::{EntityMetadata, TruthSource};
    use stockmesh_db::DbConfig;

    const KEY: [u8; 32] = [7u8; 32];

    fn change() -> PushRequest {
        let mut metadata = EntityMetadata::new(EntityType::Tracking, "TEST-1", "nodeA");
        metadata.increment_version("nodeA");
        metadata.set_source(TruthSource::Local, None);
        PushRequest {
            entity_type: EntityType::Tracking,
            entity_id: "TEST-1".into(),
            operation: PushOperation::Upsert,
            data: Some(json!({"status": "in_transit"})),
            metadata,
            artifacts: Vec::new(),
        }
    }

    fn to_packet(envelope: RelayEnvelope) -> EncryptedPacket {
        EncryptedPacket {
            id: envelope.id,
            sender_id: envelope.sender_id,
            recipient_id: envelope.recipient_id,
            entity_type: envelope.entity_type,
            entity_id: envelope.entity_id,
            version: envelope.version,
            nonce: envelope.nonce,
            ciphertext: envelope.ciphertext,
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(1),
            forwarded_at: None,
        }
    }

    #[test]
    fn test_seal_open() {
        let a = SecurityLayer::from_key("nodeA", &KEY).unwrap();
        let b = SecurityLayer::from_key("nodeB", &KEY).unwrap();

        let envelope = a.seal("nodeB", &change()).unwrap();
        assert!(!envelope.ciphertext.contains("in_transit"));
        assert_eq!(BASE64.decode(&envelope.nonce).unwrap().len(), 12);

        let opened = b.open(&to_packet(envelope)).unwrap();
        assert_eq!(opened.entity_id, "TEST-1");
        assert_eq!(opened.data, Some(json!({"status": "in_transit"})));
    }

    #[test]
    fn test_tampered_header_rejected() {
        let a = SecurityLayer::from_key("nodeA", &KEY).unwrap();
        let b = SecurityLayer::from_key("nodeB", &KEY).unwrap();

        let mut packet = to_packet(a.seal("nodeB", &change()).unwrap());
        packet.version += 1;
        assert!(matches!(b.open(&packet), Err(SyncError::DecryptionFailed(_))));

        let other = SecurityLayer::from_key("nodeB", &[9u8; 32]).unwrap();
        let packet = to_packet(a.seal("nodeB", &change()).unwrap());
        assert!(other.open(&packet).is_err());

        let c = SecurityLayer::from_key("nodeC", &KEY).unwrap();
        assert!(c.open(&packet).is_err());
    }

    #[test]
    fn test_relay_role_has_no_security_layer() {
        let mut config = SyncConfig::default();
        config.role = stockmesh_core::NodeRole::BlindRelay;
        config.relay.network_key = Some(hex::encode(KEY));
        assert!(matches!(
            SecurityLayer::from_config(&config),
            Err(SyncError::RoleMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_store_validates_and_forwards() {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let settings = RelaySettings {
            max_packet_bytes: 4096,
            ..RelaySettings::default()
        };
        let store = RelayStore::new(db.clone(), &settings);
        let a = SecurityLayer::from_key("nodeA", &KEY).unwrap();

        let good = a.seal("nodeB", &change()).unwrap();
        let mut spoofed = a.seal("nodeB", &change()).unwrap();
        spoofed.sender_id = "nodeC".into();
        let mut huge = a.seal("nodeB", &change()).unwrap();
        huge.ciphertext = "A".repeat(8192);

        let good_id = good.id.clone();
        let response = store
            .accept(
                "nodeA",
                RelayPushRequest {
                    envelopes: vec![good, spoofed, huge],
                },
            )
            .await
            .unwrap();
        assert_eq!(response.accepted, vec![good_id.clone()]);
        assert_eq!(response.rejected.len(), 2);

        assert!(store.fetch("nodeC", None).await.unwrap().is_empty());
        let packets = store.fetch("nodeB", None).await.unwrap();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].forwarded_at.is_some());

        assert_eq!(store.ack("nodeC", &[good_id.clone()]).await.unwrap(), 0);
        assert_eq!(store.ack("nodeB", &[good_id]).await.unwrap(), 1);
        assert_eq!(db.relay_packets().count_for("nodeB").await.unwrap(), 0);
    }
}
