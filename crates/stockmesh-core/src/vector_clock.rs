//! # Vector Clock
//!
//! Per-entity causality tracking.
//!
//! ## Comparison Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Vector Clock Comparison                           │
//! │                                                                         │
//! │  Missing entries count as 0. Every node id present in either clock     │
//! │  is compared.                                                          │
//! │                                                                         │
//! │   A = {nodeA: 3, nodeB: 1}     B = {nodeA: 2, nodeB: 1}                │
//! │   every A[i] >= B[i], one strictly greater     → A Dominates B         │
//! │                                                                         │
//! │   A = {nodeA: 3}               B = {nodeA: 2, nodeB: 2}                │
//! │   A[nodeA] > B[nodeA] but A[nodeB] < B[nodeB]  → Concurrent            │
//! │                                                                         │
//! │   A = {nodeA: 2}               B = {nodeA: 2, nodeB: 0}                │
//! │   all components equal                          → Equal                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A node only ever increments its own counter. `merge` is used after a
//! remote version has been observed, so the local history covers both.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Result of comparing two vector clocks, from the point of view of `self`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    /// `self` has seen everything `other` has, and more.
    Dominates,
    /// `other` has seen everything `self` has, and more.
    Dominated,
    /// Identical causal history.
    Equal,
    /// Each side has seen writes the other has not.
    Concurrent,
}

impl std::fmt::Display for ClockOrdering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClockOrdering::Dominates => write!(f, "dominates"),
            ClockOrdering::Dominated => write!(f, "dominated"),
            ClockOrdering::Equal => write!(f, "equal"),
            ClockOrdering::Concurrent => write!(f, "concurrent"),
        }
    }
}

/// Mapping from node instance id to a monotonically increasing counter.
///
/// Serialized as a plain JSON object: `{"nodeA": 3, "nodeB": 1}`.
/// A `BTreeMap` keeps the serialized form stable, which matters because the
/// clock is stored alongside hashed metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, i64>);

impl VectorClock {
    /// Creates an empty clock.
    pub fn new() -> Self {
        VectorClock(BTreeMap::new())
    }

    /// Bumps the counter of `instance_id`. Called on every local write.
    pub fn increment(&mut self, instance_id: &str) {
        *self.0.entry(instance_id.to_string()).or_insert(0) += 1;
    }

    /// Returns the counter for `instance_id` (0 if absent).
    pub fn get(&self, instance_id: &str) -> i64 {
        self.0.get(instance_id).copied().unwrap_or(0)
    }

    /// Sets the counter for `instance_id` directly.
    pub fn set(&mut self, instance_id: &str, value: i64) {
        self.0.insert(instance_id.to_string(), value);
    }

    /// Component-wise maximum with `other`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, &counter) in &other.0 {
            let entry = self.0.entry(node.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Returns a new clock that is the component-wise maximum of both.
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Compares `self` against `other`.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut greater = false;
        let mut lesser = false;

        for node in self.0.keys().chain(other.0.keys()) {
            let mine = self.get(node);
            let theirs = other.get(node);
            if mine > theirs {
                greater = true;
            } else if mine < theirs {
                lesser = true;
            }
            if greater && lesser {
                return ClockOrdering::Concurrent;
            }
        }

        match (greater, lesser) {
            (true, false) => ClockOrdering::Dominates,
            (false, true) => ClockOrdering::Dominated,
            (false, false) => ClockOrdering::Equal,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True if `self` strictly dominates `other`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Dominates
    }

    /// True if `self` causally precedes `other`.
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Dominated
    }

    /// True if no node has written yet.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&c| c == 0)
    }

    /// Number of node entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates `(node_id, counter)` pairs in node id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Validates structural invariants.
    pub fn validate(&self) -> CoreResult<()> {
        for (node, &counter) in &self.0 {
            if node.is_empty() {
                return Err(CoreError::InvalidVectorClock("empty node id".into()));
            }
            if counter < 0 {
                return Err(CoreError::InvalidVectorClock(format!(
                    "negative counter {} for node {}",
                    counter, node
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (node, counter)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", node, counter)?;
        }
        write!(f, "}}")
    }
}

impl<const N: usize> From<[(&str, i64); N]> for VectorClock {
    fn from(entries: [(&str, i64); N]) -> Self {
        VectorClock(entries.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_only_touches_own_counter() {
        let mut clock = VectorClock::from([("nodeB", 4)]);
        clock.increment("nodeA");
        clock.increment("nodeA");
        assert_eq!(clock.get("nodeA"), 2);
        assert_eq!(clock.get("nodeB"), 4);
    }

    #[test]
    fn test_successive_writes_dominate() {
        let mut clock = VectorClock::new();
        clock.increment("nodeA");
        let w1 = clock.clone();
        clock.increment("nodeA");
        assert_eq!(clock.compare(&w1), ClockOrdering::Dominates);
        assert!(w1.happened_before(&clock));
    }

    #[test]
    fn test_compare_concurrent() {
        let a = VectorClock::from([("nodeA", 3)]);
        let b = VectorClock::from([("nodeA", 2), ("nodeB", 2)]);
        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
        assert_eq!(b.compare(&a), ClockOrdering::Concurrent);
    }

    #[test]
    fn test_compare_missing_entries_are_zero() {
        let a = VectorClock::from([("nodeA", 2)]);
        let b = VectorClock::from([("nodeA", 2), ("nodeB", 0)]);
        assert_eq!(a.compare(&b), ClockOrdering::Equal);
        assert_eq!(VectorClock::new().compare(&a), ClockOrdering::Dominated);
    }

    #[test]
    fn test_merge_is_componentwise_max() {
        let mut a = VectorClock::from([("nodeA", 3), ("nodeC", 1)]);
        let b = VectorClock::from([("nodeA", 2), ("nodeB", 2)]);
        a.merge(&b);
        assert_eq!(a, VectorClock::from([("nodeA", 3), ("nodeB", 2), ("nodeC", 1)]));
        assert!(a.dominates(&b));
    }

    #[test]
    fn test_validate_rejects_bad_entries() {
        assert!(VectorClock::from([("", 1)]).validate().is_err());
        assert!(VectorClock::from([("nodeA", -1)]).validate().is_err());
        assert!(VectorClock::from([("nodeA", 1)]).validate().is_ok());
    }

    #[test]
    fn test_json_shape() {
        let clock = VectorClock::from([("nodeA", 1)]);
        assert_eq!(serde_json::to_string(&clock).unwrap(), r#"{"nodeA":1}"#);
        let parsed: VectorClock = serde_json::from_str(r#"{"nodeB":7}"#).unwrap();
        assert_eq!(parsed.get("nodeB"), 7);
    }
}
