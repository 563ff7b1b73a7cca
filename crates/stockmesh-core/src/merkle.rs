//! # Merkle Bucket Tree
//!
//! Two-level summary of every entity hash of one type, used to find the
//! differing subset between two nodes without listing every id.
//!
//! ```text
//!                        root = sha256("a:<h>;b:<h>;...;_:<h>;")
//!                 ┌──────────┬───────────┴───────────┬──────────┐
//!   level 0    bucket "a"  bucket "b"     ...     bucket "z"  bucket "_"
//!                 │
//!   level 1    {id → full_hash} for ids starting with 'a'
//! ```
//!
//! Buckets are keyed by the lower-cased first character of the entity id.
//! A bucket hash is the first 8 bytes (hex) of the sha256 over its sorted
//! `"id:hash;"` entries.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::checksum::sha256_hex;

/// Bucket key for ids that are empty.
pub const EMPTY_BUCKET: &str = "_";

/// Returns the bucket key for an entity id.
pub fn bucket_key(entity_id: &str) -> String {
    entity_id
        .chars()
        .next()
        .map(|c| c.to_lowercase().collect::<String>())
        .unwrap_or_else(|| EMPTY_BUCKET.to_string())
}

/// Entity hashes grouped into buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleTree {
    buckets: BTreeMap<String, BTreeMap<String, String>>,
}

/// What two trees disagree on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleDiff {
    /// Ids the remote has (or has differently) that we should request.
    pub need_from_remote: Vec<String>,
    /// Ids only we have.
    pub need_to_send: Vec<String>,
}

impl MerkleDiff {
    pub fn is_empty(&self) -> bool {
        self.need_from_remote.is_empty() && self.need_to_send.is_empty()
    }
}

impl MerkleTree {
    pub fn new() -> Self {
        MerkleTree::default()
    }

    /// Builds a tree from `(entity_id, full_hash)` pairs.
    pub fn from_hashes<I, K, V>(hashes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut tree = MerkleTree::new();
        for (id, hash) in hashes {
            tree.insert(id, hash);
        }
        tree
    }

    pub fn insert(&mut self, entity_id: impl Into<String>, full_hash: impl Into<String>) {
        let id = entity_id.into();
        self.buckets
            .entry(bucket_key(&id))
            .or_default()
            .insert(id, full_hash.into());
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hash of one bucket, or `None` if the bucket is absent.
    pub fn bucket_hash(&self, bucket: &str) -> Option<String> {
        self.buckets.get(bucket).map(|entries| {
            let mut hasher = Sha256::new();
            for (id, hash) in entries {
                hasher.update(id.as_bytes());
                hasher.update(b":");
                hasher.update(hash.as_bytes());
                hasher.update(b";");
            }
            hex::encode(&hasher.finalize()[..8])
        })
    }

    /// Level 0: bucket key → bucket hash.
    pub fn bucket_hashes(&self) -> BTreeMap<String, String> {
        self.buckets
            .keys()
            .filter_map(|k| self.bucket_hash(k).map(|h| (k.clone(), h)))
            .collect()
    }

    /// Root hash over all bucket hashes.
    pub fn root(&self) -> String {
        let mut buf = String::new();
        for (bucket, hash) in self.bucket_hashes() {
            buf.push_str(&bucket);
            buf.push(':');
            buf.push_str(&hash);
            buf.push(';');
        }
        sha256_hex(buf.as_bytes())
    }

    /// Level 1: entity hashes inside one bucket.
    pub fn bucket_entries(&self, bucket: &str) -> BTreeMap<String, String> {
        self.buckets.get(bucket).cloned().unwrap_or_default()
    }

    /// Buckets whose hashes differ from (or are missing in) `remote_buckets`.
    pub fn differing_buckets(&self, remote_buckets: &BTreeMap<String, String>) -> Vec<String> {
        let local = self.bucket_hashes();
        let keys: BTreeSet<&String> = local.keys().chain(remote_buckets.keys()).collect();
        keys.into_iter()
            .filter(|k| local.get(*k) != remote_buckets.get(*k))
            .cloned()
            .collect()
    }

    /// Entity-level diff for one bucket against the remote's entries.
    pub fn diff_bucket(&self, bucket: &str, remote_entries: &BTreeMap<String, String>) -> MerkleDiff {
        let local = self.bucket_entries(bucket);
        let mut diff = MerkleDiff::default();
        for (id, hash) in remote_entries {
            if local.get(id) != Some(hash) {
                diff.need_from_remote.push(id.clone());
            }
        }
        for id in local.keys() {
            if !remote_entries.contains_key(id) {
                diff.need_to_send.push(id.clone());
            }
        }
        diff
    }

    /// Full diff against a complete remote tree.
    pub fn diff(&self, remote: &MerkleTree) -> MerkleDiff {
        let mut out = MerkleDiff::default();
        if self.root() == remote.root() {
            return out;
        }
        for bucket in self.differing_buckets(&remote.bucket_hashes()) {
            let part = self.diff_bucket(&bucket, &remote.bucket_entries(&bucket));
            out.need_from_remote.extend(part.need_from_remote);
            out.need_to_send.extend(part.need_to_send);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_key() {
        assert_eq!(bucket_key("Shelf-A"), "s");
        assert_eq!(bucket_key("7bin"), "7");
        assert_eq!(bucket_key(""), "_");
    }

    #[test]
    fn test_equal_trees_have_equal_roots() {
        let a = MerkleTree::from_hashes([("p1", "h1"), ("q2", "h2")]);
        let b = MerkleTree::from_hashes([("q2", "h2"), ("p1", "h1")]);
        assert_eq!(a.root(), b.root());
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn test_diff_reports_changed_and_missing() {
        let local = MerkleTree::from_hashes([("p1", "h1"), ("p2", "h2"), ("x9", "hx")]);
        let remote = MerkleTree::from_hashes([("p1", "h1"), ("p2", "CHANGED"), ("r5", "h5")]);

        let diff = local.diff(&remote);
        assert_eq!(diff.need_from_remote, vec!["p2".to_string(), "r5".to_string()]);
        assert_eq!(diff.need_to_send, vec!["x9".to_string()]);
    }

    #[test]
    fn test_unchanged_bucket_is_skipped() {
        let local = MerkleTree::from_hashes([("a1", "h"), ("b1", "h")]);
        let remote = MerkleTree::from_hashes([("a1", "h"), ("b1", "other")]);
        assert_eq!(local.differing_buckets(&remote.bucket_hashes()), vec!["b".to_string()]);
    }

    #[test]
    fn test_bucket_hash_is_16_hex_chars() {
        let tree = MerkleTree::from_hashes([("a1", "h")]);
        assert_eq!(tree.bucket_hash("a").unwrap().len(), 16);
        assert!(tree.bucket_hash("z").is_none());
    }
}
