//! # Checksum Tree
//!
//! Deterministic hashing of entity content and of entity hierarchies.
//!
//! ## Hash Composition
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Checksum Tree Node                               │
//! │                                                                         │
//! │   content_hash  = sha256(canonical JSON, volatile fields removed)       │
//! │                                                                         │
//! │   children_hash = sha256("c1:<full1>;c2:<full2>;...")  sorted by id     │
//! │                   "" for a leaf                                         │
//! │                                                                         │
//! │   full_hash     = sha256(content_hash ∥ children_hash)                   │
//! │                                                                         │
//! │        location WH/A  (full = f(content, h(shelf1, shelf2)))           │
//! │          ├── shelf1   (full = f(content, ""))                           │
//! │          └── shelf2   (full = f(content, h(bin7)))                      │
//! │                └── bin7                                                 │
//! │                                                                         │
//! │   Changing bin7 changes shelf2 and WH/A, never shelf1.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Canonical JSON sorts object keys at every depth, so the hash does not
//! depend on storage order or on serializer settings.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CoreResult;
use crate::types::EntityType;

/// Top-level fields that are bookkeeping, not content.
pub const VOLATILE_FIELDS: &[&str] = &[
    "updated_at",
    "write_date",
    "create_date",
    "created_at",
    "last_synced_at",
    "modified_at",
    "metadata",
    "__last_update",
];

/// SHA-256 of `input`, lowercase hex.
pub fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

/// Computes content hashes for entity payloads.
#[derive(Debug, Clone)]
pub struct ChecksumCalculator {
    instance_id: String,
}

impl ChecksumCalculator {
    pub fn new(instance_id: impl Into<String>) -> Self {
        ChecksumCalculator {
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Hash of any serializable entity.
    pub fn compute_checksum<T: Serialize>(&self, entity: &T) -> CoreResult<String> {
        let value = serde_json::to_value(entity)?;
        Ok(self.compute_content_hash(&value))
    }

    /// Hash of a JSON payload with volatile top-level fields removed.
    pub fn compute_content_hash(&self, data: &Value) -> String {
        let mut canonical = String::new();
        match data {
            Value::Object(map) => {
                let filtered: BTreeMap<&String, &Value> = map
                    .iter()
                    .filter(|(k, _)| !VOLATILE_FIELDS.contains(&k.as_str()))
                    .collect();
                canonical.push('{');
                for (i, (k, v)) in filtered.into_iter().enumerate() {
                    if i > 0 {
                        canonical.push(',');
                    }
                    write_json_string(k, &mut canonical);
                    canonical.push(':');
                    write_canonical(v, &mut canonical);
                }
                canonical.push('}');
            }
            other => write_canonical(other, &mut canonical),
        }
        sha256_hex(canonical.as_bytes())
    }

    /// Builds a leaf checksum node for a payload.
    pub fn build_entity(&self, entity_type: EntityType, entity_id: &str, data: &Value) -> ChecksumEntity {
        let mut entity = ChecksumEntity::new(entity_type, entity_id);
        entity.source_instance = self.instance_id.clone();
        entity.set_content_hash(self.compute_content_hash(data));
        entity
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (k, v)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(k, out);
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        Value::String(s) => write_json_string(s, out),
        other => out.push_str(&other.to_string()),
    }
}

fn write_json_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_string()).to_string());
}

// =============================================================================
// Checksum Entity
// =============================================================================

/// One node of the checksum tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecksumEntity {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub content_hash: String,
    #[serde(default)]
    pub children_hash: String,
    pub full_hash: String,
    #[serde(default)]
    pub child_count: i64,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub source_instance: String,
    #[serde(default)]
    pub source_device: Option<String>,
    /// child id → child full hash
    #[serde(default)]
    pub children: BTreeMap<String, String>,
}

impl ChecksumEntity {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        let mut entity = ChecksumEntity {
            entity_type,
            entity_id: entity_id.into(),
            content_hash: String::new(),
            children_hash: String::new(),
            full_hash: String::new(),
            child_count: 0,
            last_updated: Utc::now(),
            source_instance: String::new(),
            source_device: None,
            children: BTreeMap::new(),
        };
        entity.recompute();
        entity
    }

    pub fn set_content_hash(&mut self, hash: impl Into<String>) {
        self.content_hash = hash.into();
        self.recompute();
    }

    /// Inserts or replaces a child's full hash.
    pub fn add_child(&mut self, child_id: impl Into<String>, child_hash: impl Into<String>) {
        self.children.insert(child_id.into(), child_hash.into());
        self.recompute();
    }

    /// Returns true if the child was present.
    pub fn remove_child(&mut self, child_id: &str) -> bool {
        let removed = self.children.remove(child_id).is_some();
        if removed {
            self.recompute();
        }
        removed
    }

    /// Recomputes `children_hash`, `child_count` and `full_hash`.
    pub fn recompute(&mut self) {
        self.children_hash = children_hash(&self.children);
        self.child_count = self.children.len() as i64;
        self.full_hash = full_hash(&self.content_hash, &self.children_hash);
        self.last_updated = Utc::now();
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// True if `hash` equals this node's full hash.
    pub fn matches(&self, hash: &str) -> bool {
        self.full_hash == hash
    }
}

/// Hash over child full hashes ordered by child id. Empty for leaves.
pub fn children_hash(children: &BTreeMap<String, String>) -> String {
    if children.is_empty() {
        return String::new();
    }
    let mut buf = String::new();
    for (id, hash) in children {
        buf.push_str(id);
        buf.push(':');
        buf.push_str(hash);
        buf.push(';');
    }
    sha256_hex(buf.as_bytes())
}

/// `sha256(content_hash ∥ children_hash)`.
pub fn full_hash(content_hash: &str, children_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content_hash.as_bytes());
    hasher.update(children_hash.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_hash_is_deterministic_and_order_free() {
        let calc = ChecksumCalculator::new("nodeA");
        let a = json!({"name": "Shelf A", "usage": "internal", "barcode": "LOC-1"});
        let b = json!({"usage": "internal", "barcode": "LOC-1", "name": "Shelf A"});
        let h = calc.compute_content_hash(&a);
        assert_eq!(h.len(), 64);
        assert_eq!(h, calc.compute_content_hash(&b));
    }

    #[test]
    fn test_volatile_fields_are_ignored() {
        let calc = ChecksumCalculator::new("nodeA");
        let a = json!({"name": "P", "write_date": "2026-01-01T00:00:00Z"});
        let b = json!({"name": "P", "write_date": "2026-03-01T00:00:00Z", "updated_at": "x"});
        assert_eq!(calc.compute_content_hash(&a), calc.compute_content_hash(&b));
    }

    #[test]
    fn test_content_change_changes_hash() {
        let calc = ChecksumCalculator::new("nodeA");
        let a = json!({"name": "P", "nested": {"qty": 1}});
        let b = json!({"name": "P", "nested": {"qty": 2}});
        assert_ne!(calc.compute_content_hash(&a), calc.compute_content_hash(&b));
    }

    #[test]
    fn test_leaf_has_empty_children_hash() {
        let mut node = ChecksumEntity::new(EntityType::Location, "bin7");
        node.set_content_hash("abc");
        assert!(!node.has_children());
        assert_eq!(node.children_hash, "");
        assert_eq!(node.full_hash, full_hash("abc", ""));
    }

    #[test]
    fn test_child_change_propagates_to_full_hash() {
        let mut parent = ChecksumEntity::new(EntityType::Location, "WH/A");
        parent.set_content_hash("content");
        parent.add_child("shelf1", "h1");
        parent.add_child("shelf2", "h2");
        let before = parent.full_hash.clone();

        parent.add_child("shelf2", "h2-changed");
        assert_ne!(parent.full_hash, before);
        assert_eq!(parent.content_hash, "content");
        assert_eq!(parent.child_count, 2);
    }

    #[test]
    fn test_children_hash_ignores_insertion_order() {
        let mut a = ChecksumEntity::new(EntityType::Picking, "PICK-1");
        a.add_child("m2", "x");
        a.add_child("m1", "y");
        let mut b = ChecksumEntity::new(EntityType::Picking, "PICK-1");
        b.add_child("m1", "y");
        b.add_child("m2", "x");
        assert!(a.matches(&b.full_hash));
    }

    #[test]
    fn test_sibling_change_does_not_touch_other_subtree() {
        let calc = ChecksumCalculator::new("nodeA");
        let shelf1 = calc.build_entity(EntityType::Location, "shelf1", &json!({"name": "s1"}));
        let mut shelf2 = calc.build_entity(EntityType::Location, "shelf2", &json!({"name": "s2"}));
        let shelf1_before = shelf1.full_hash.clone();
        shelf2.add_child("bin7", "bin-hash");
        assert_eq!(shelf1.full_hash, shelf1_before);
    }

    #[test]
    fn test_remove_child() {
        let mut parent = ChecksumEntity::new(EntityType::Picking, "PICK-1");
        parent.add_child("m1", "y");
        assert!(parent.remove_child("m1"));
        assert!(!parent.remove_child("m1"));
        assert_eq!(parent.children_hash, "");
    }
}
