//! # Exchange Service
//!
//! The answering side of pull, Merkle and negotiate requests. Reads the
//! local store only; writes arrive through the inbound applier.
//!
//! ```text
//! pull       metadata.changed_since(since, after_id) ──► WireRecord[]
//!            (ids)  metadata.by_ids                      + cursor when full
//! merkle     checksums.full_hashes ──► level 0 buckets | level 1 entries
//! negotiate  server tree vs requester hashes ──► to_pull / to_push
//! ```

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use stockmesh_core::filter::matches_all;
use stockmesh_core::{ChecksumEntity, EntityMetadata, EntityType, MerkleTree, SyncStrategy};
use stockmesh_db::{ChangeQuery, Database};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    ChecksumComparison, CompareRequest, MerkleRequest, MerkleResponse, NegotiateRequest, NegotiateResponse,
    PullCursor, PullRequest, PullResponse, WireRecord,
};

/// Hard cap on records per type in one pull chunk.
pub const MAX_PULL_LIMIT: usize = 1000;

/// Hard cap on explicit ids in one pull.
pub const MAX_PULL_IDS: usize = 5000;

pub struct ExchangeService {
    db: Arc<Database>,
    config: Arc<SyncConfig>,
}

impl ExchangeService {
    pub fn new(db: Arc<Database>, config: Arc<SyncConfig>) -> Self {
        ExchangeService { db, config }
    }

    fn serves(&self, entity_type: EntityType) -> bool {
        self.config.entity(entity_type).map(|e| e.enabled).unwrap_or(false)
    }

    // =========================================================================
    // Pull
    // =========================================================================

    pub async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        if request.entity_types.is_empty() {
            return Err(SyncError::BadRequest("entity_types must not be empty".into()));
        }
        for filter in &request.filters {
            filter.validate()?;
        }
        if let Some(ids) = &request.ids {
            if ids.len() > MAX_PULL_IDS {
                return Err(SyncError::BadRequest(format!(
                    "at most {} ids per pull, got {}",
                    MAX_PULL_IDS,
                    ids.len()
                )));
            }
        }

        let limit = request
            .limit
            .unwrap_or(self.config.transport.batch_size)
            .clamp(1, MAX_PULL_LIMIT);
        let strategy = request.strategy.unwrap_or(SyncStrategy::Full);

        let mut response = PullResponse::new();
        for &entity_type in &request.entity_types {
            if !self.serves(entity_type) {
                debug!(entity_type = %entity_type, "Pull for a type this node does not sync");
                response.records.insert(entity_type, Vec::new());
                continue;
            }

            let metas = match &request.ids {
                Some(ids) => self.db.metadata().by_ids(entity_type, ids).await?,
                None => {
                    let query = ChangeQuery {
                        since: request.since,
                        after_id: request.since.and(request.after_id.as_deref()),
                        limit: limit as i64,
                        active_only: strategy == SyncStrategy::ActiveOnly,
                    };
                    let metas = self.db.metadata().changed_since(entity_type, &query).await?;
                    if metas.len() == limit {
                        if let Some(last) = metas.last() {
                            response.cursors.insert(
                                entity_type,
                                PullCursor {
                                    since: last.modified_at,
                                    after_id: last.entity_id.clone(),
                                },
                            );
                        }
                    }
                    metas
                }
            };

            // Explicit ids always carry data.
            let with_data = request.ids.is_some() || strategy != SyncStrategy::MetadataOnly;
            let records = self
                .wire_records(entity_type, metas, with_data, &request.filters)
                .await?;
            response.records.insert(entity_type, records);
        }

        response.server_time = Utc::now();
        Ok(response)
    }

    async fn wire_records(
        &self,
        entity_type: EntityType,
        metas: Vec<EntityMetadata>,
        with_data: bool,
        filters: &[stockmesh_core::SyncFilter],
    ) -> SyncResult<Vec<WireRecord>> {
        let mut out = Vec::with_capacity(metas.len());
        for meta in metas {
            let artifacts = self.db.conflicts().carried_by(&meta).await?;
            if meta.deleted {
                out.push(WireRecord {
                    entity_id: meta.entity_id.clone(),
                    data: None,
                    metadata: meta,
                    artifacts,
                });
                continue;
            }

            let needs_payload = with_data || !filters.is_empty();
            let data = if needs_payload {
                match self.db.records().get(entity_type, &meta.entity_id).await? {
                    Some(record) => Some(record.data),
                    None => {
                        warn!(
                            entity_type = %entity_type,
                            entity_id = %meta.entity_id,
                            "Metadata without payload, skipped"
                        );
                        continue;
                    }
                }
            } else {
                None
            };

            if let Some(data) = &data {
                if !matches_all(filters, data) {
                    continue;
                }
            }

            out.push(WireRecord {
                entity_id: meta.entity_id.clone(),
                data: if with_data { data } else { None },
                metadata: meta,
                artifacts,
            });
        }
        Ok(out)
    }

    // =========================================================================
    // Checksums
    // =========================================================================

    pub async fn merkle(&self, request: &MerkleRequest) -> SyncResult<MerkleResponse> {
        let tree = MerkleTree::from_hashes(self.db.checksums().full_hashes(request.entity_type).await?);
        let mut response = MerkleResponse {
            root: tree.root(),
            server_time: Utc::now(),
            ..Default::default()
        };
        match &request.bucket {
            Some(bucket) => response.entries = tree.bucket_entries(bucket),
            None => response.buckets = tree.bucket_hashes(),
        }
        Ok(response)
    }

    /// Compares the requester's full hashes against ours.
    ///
    /// An id the requester holds that we only know as a tombstone goes to
    /// `to_pull` so the requester learns about the delete.
    pub async fn negotiate(&self, request: &NegotiateRequest) -> SyncResult<NegotiateResponse> {
        let entity_type = request.entity_type;
        let hashes = self.db.checksums().full_hashes(entity_type).await?;
        let ours = MerkleTree::from_hashes(hashes.clone());
        let theirs = MerkleTree::from_hashes(request.hashes.clone());
        let diff = ours.diff(&theirs);

        let mut to_pull = diff.need_to_send;
        let mut unknown = Vec::new();
        for id in diff.need_from_remote {
            if hashes.contains_key(&id) {
                to_pull.push(id);
            } else {
                unknown.push(id);
            }
        }

        let tombstoned: Vec<String> = self
            .db
            .metadata()
            .by_ids(entity_type, &unknown)
            .await?
            .into_iter()
            .filter(|m| m.deleted)
            .map(|m| m.entity_id)
            .collect();
        let to_push = unknown.into_iter().filter(|id| !tombstoned.contains(id)).collect();
        to_pull.extend(tombstoned);
        to_pull.sort();

        let response = NegotiateResponse {
            to_pull,
            to_push,
            server_time: Utc::now(),
        };
        debug!(
            entity_type = %entity_type,
            to_pull = response.to_pull.len(),
            to_push = response.to_push.len(),
            "Checksum negotiation"
        );
        Ok(response)
    }

    pub async fn compare(&self, request: &CompareRequest) -> SyncResult<Vec<ChecksumComparison>> {
        let ours = self.db.checksums().full_hashes(request.entity_type).await?;
        Ok(request
            .hashes
            .iter()
            .map(|(id, remote_hash)| {
                let local_hash = ours.get(id).cloned();
                ChecksumComparison {
                    entity_id: id.clone(),
                    matches: local_hash.as_deref() == Some(remote_hash.as_str()),
                    local_hash,
                    remote_hash: remote_hash.clone(),
                }
            })
            .collect())
    }

    pub async fn checksums(&self, entity_type: EntityType) -> SyncResult<Vec<ChecksumEntity>> {
        Ok(self.db.checksums().list(entity_type).await?)
    }

    pub async fn checksum(&self, entity_type: EntityType, entity_id: &str) -> SyncResult<ChecksumEntity> {
        self.db
            .checksums()
            .get(entity_type, entity_id)
            .await?
            .map(|stored| stored.entity)
            .ok_or_else(|| SyncError::NotFound(format!("checksum {}/{}", entity_type, entity_id)))
    }

    /// Local full hashes of one type, as a requester sends them.
    pub async fn local_hashes(&self, entity_type: EntityType) -> SyncResult<BTreeMap<String, String>> {
        Ok(self.db.checksums().full_hashes(entity_type).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stockmesh_core::TruthSource;
    use stockmesh_db::DbConfig;

    use crate::interceptor::{WriteContext, WriteInterceptor};

    async fn setup() -> (Arc<Database>, WriteInterceptor, ExchangeService) {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let mut config = SyncConfig::default();
        config.node.instance_id = "nodeA".into();
        let config = Arc::new(config);
        let interceptor = WriteInterceptor::new(db.clone(), config.clone());
        let exchange = ExchangeService::new(db.clone(), config);
        (db, interceptor, exchange)
    }

    #[tokio::test]
    async fn test_pull_chunks_with_cursor() {
        let (_db, interceptor, exchange) = setup().await;
        let ctx = WriteContext::new(TruthSource::Local);
        for i in 0..5 {
            interceptor
                .upsert(EntityType::Product, &format!("P{}", i), &json!({"name": i}), &ctx)
                .await
                .unwrap();
        }

        let mut request = PullRequest::since(EntityType::Product, None);
        request.limit = Some(3);
        let mut first = exchange.pull(&request).await.unwrap();
        assert!(first.has_more());
        assert_eq!(first.take(EntityType::Product).len(), 3);

        let cursor = first.cursors[&EntityType::Product].clone();
        request.since = Some(cursor.since);
        request.after_id = Some(cursor.after_id);
        let mut second = exchange.pull(&request).await.unwrap();
        assert!(!second.has_more());
        let rest = second.take(EntityType::Product);
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|r| r.data.is_some()));
    }

    #[tokio::test]
    async fn test_active_only_and_metadata_only() {
        let (_db, interceptor, exchange) = setup().await;
        let ctx = WriteContext::new(TruthSource::Local);
        interceptor
            .upsert(EntityType::Product, "P1", &json!({"active": true}), &ctx)
            .await
            .unwrap();
        interceptor
            .upsert(EntityType::Product, "P2", &json!({"active": false}), &ctx)
            .await
            .unwrap();
        interceptor.upsert(EntityType::Product, "P3", &json!({}), &ctx).await.unwrap();
        interceptor.delete(EntityType::Product, "P3", &ctx).await.unwrap();

        let mut request = PullRequest::since(EntityType::Product, None);
        request.strategy = Some(SyncStrategy::ActiveOnly);
        let mut active = exchange.pull(&request).await.unwrap();
        let ids: Vec<_> = active.take(EntityType::Product).into_iter().map(|r| r.entity_id).collect();
        assert_eq!(ids, vec!["P1"]);

        request.strategy = Some(SyncStrategy::MetadataOnly);
        let mut meta_only = exchange.pull(&request).await.unwrap();
        let records = meta_only.take(EntityType::Product);
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.data.is_none()));
        assert!(records.iter().any(|r| r.is_tombstone()));
    }

    #[tokio::test]
    async fn test_negotiate_sends_tombstones_back() {
        let (_db, interceptor, exchange) = setup().await;
        let ctx = WriteContext::new(TruthSource::Local);
        interceptor.upsert(EntityType::Product, "A1", &json!({"n": 1}), &ctx).await.unwrap();
        interceptor.upsert(EntityType::Product, "B1", &json!({"n": 2}), &ctx).await.unwrap();
        interceptor.upsert(EntityType::Product, "C1", &json!({"n": 3}), &ctx).await.unwrap();
        interceptor.delete(EntityType::Product, "C1", &ctx).await.unwrap();

        let ours = exchange.local_hashes(EntityType::Product).await.unwrap();
        let mut hashes = BTreeMap::new();
        hashes.insert("A1".to_string(), ours["A1"].clone());
        hashes.insert("B1".to_string(), "stale".to_string());
        hashes.insert("C1".to_string(), "whatever".to_string());
        hashes.insert("D1".to_string(), "new".to_string());

        let response = exchange
            .negotiate(&NegotiateRequest {
                entity_type: EntityType::Product,
                hashes,
            })
            .await
            .unwrap();
        assert_eq!(response.to_pull, vec!["B1".to_string(), "C1".to_string()]);
        assert_eq!(response.to_push, vec!["D1".to_string()]);
    }

    #[tokio::test]
    async fn test_merkle_levels_and_compare() {
        let (_db, interceptor, exchange) = setup().await;
        let ctx = WriteContext::new(TruthSource::Local);
        interceptor.upsert(EntityType::Product, "a1", &json!({"n": 1}), &ctx).await.unwrap();
        interceptor.upsert(EntityType::Product, "b1", &json!({"n": 2}), &ctx).await.unwrap();

        let level0 = exchange
            .merkle(&MerkleRequest {
                entity_type: EntityType::Product,
                bucket: None,
            })
            .await
            .unwrap();
        assert_eq!(level0.buckets.len(), 2);
        assert!(level0.entries.is_empty());

        let level1 = exchange
            .merkle(&MerkleRequest {
                entity_type: EntityType::Product,
                bucket: Some("a".into()),
            })
            .await
            .unwrap();
        assert_eq!(level1.entries.keys().collect::<Vec<_>>(), vec!["a1"]);

        let mut hashes = BTreeMap::new();
        hashes.insert("a1".to_string(), level1.entries["a1"].clone());
        hashes.insert("zz".to_string(), "x".to_string());
        let compared = exchange
            .compare(&CompareRequest {
                entity_type: EntityType::Product,
                hashes,
            })
            .await
            .unwrap();
        assert!(compared[0].matches);
        assert!(!compared[1].matches);
        assert!(compared[1].local_hash.is_none());
    }
}
