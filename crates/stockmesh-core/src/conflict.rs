//! # Conflict Resolver
//!
//! Decides between a local and an incoming version of the same entity.
//!
//! ## Decision Table
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    compare(local.clock, remote.clock)                   │
//! │                                                                         │
//! │  Dominates   → KeepLocal       remote is stale, discard                │
//! │  Dominated   → ApplyRemote     remote is newer, merge clocks           │
//! │  Equal       → NoOp            same content hash                       │
//! │              → Integrity       different hash: hard error, no winner   │
//! │  Concurrent  → policy:                                                 │
//! │     priority_based   priority ▸ updated_at ▸ instance id ▸ hash        │
//! │     last_write_wins  updated_at ▸ instance id ▸ hash                   │
//! │     server_wins      the master node's copy                            │
//! │     client_wins      the non-master node's copy                        │
//! │     manual           nothing applied, conflict recorded                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The ordering keys for `priority_based` and `last_write_wins` only read
//! fields of the two versions, never which side is local. Two nodes that
//! exchange the same pair therefore pick the same winner.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::metadata::EntityMetadata;
use crate::types::{ConflictStrategy, NodeRole};
use crate::vector_clock::{ClockOrdering, VectorClock};

/// What the caller must do with the incoming version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// Keep the local version. Merge clocks only if `merge_clock` is set.
    KeepLocal,
    /// Replace local data and metadata with the remote version.
    ApplyRemote,
    /// Already identical.
    NoOp,
    /// Leave both untouched, record a pending conflict.
    Manual,
    /// Equal clocks but different content.
    IntegrityViolation,
}

/// Which side won a concurrent conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Local,
    Remote,
}

impl Winner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Winner::Local => "local",
            Winner::Remote => "remote",
        }
    }
}

/// Classification stored on conflict records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides changed content.
    ConcurrentUpdate,
    /// One side deleted, the other updated.
    DeleteUpdate,
    /// Equal clocks, different content.
    IntegrityViolation,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::ConcurrentUpdate => "concurrent_update",
            ConflictKind::DeleteUpdate => "delete_update",
            ConflictKind::IntegrityViolation => "integrity_violation",
        }
    }
}

/// Full decision for one local/remote pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub outcome: ResolutionOutcome,
    pub ordering: ClockOrdering,
    /// Set when the versions were concurrent and a winner was picked.
    pub winner: Option<Winner>,
    pub conflict: Option<ConflictKind>,
    /// Keep the losing version as a conflict artifact.
    pub retain_loser: bool,
    /// Store `merged_clock` on the surviving version.
    pub merge_clock: bool,
    pub merged_clock: VectorClock,
    pub strategy: ConflictStrategy,
    pub reason: String,
}

/// Stateless resolver configured with a policy and the local node role.
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
    local_role: NodeRole,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy, local_role: NodeRole) -> Self {
        ConflictResolver { strategy, local_role }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Resolves `remote` against `local`.
    pub fn resolve(&self, local: &EntityMetadata, remote: &EntityMetadata) -> Resolution {
        let ordering = local.vector_clock.compare(&remote.vector_clock);
        let merged_clock = local.vector_clock.merged(&remote.vector_clock);

        let base = Resolution {
            outcome: ResolutionOutcome::NoOp,
            ordering,
            winner: None,
            conflict: None,
            retain_loser: false,
            merge_clock: false,
            merged_clock,
            strategy: self.strategy,
            reason: String::new(),
        };

        match ordering {
            ClockOrdering::Dominates => Resolution {
                outcome: ResolutionOutcome::KeepLocal,
                reason: format!(
                    "local clock {} dominates remote {}",
                    local.vector_clock, remote.vector_clock
                ),
                ..base
            },
            ClockOrdering::Dominated => Resolution {
                outcome: ResolutionOutcome::ApplyRemote,
                merge_clock: true,
                reason: format!(
                    "remote clock {} dominates local {}",
                    remote.vector_clock, local.vector_clock
                ),
                ..base
            },
            ClockOrdering::Equal => {
                if same_content(local, remote) {
                    Resolution {
                        outcome: ResolutionOutcome::NoOp,
                        reason: "equal clocks and content".into(),
                        ..base
                    }
                } else {
                    Resolution {
                        outcome: ResolutionOutcome::IntegrityViolation,
                        conflict: Some(ConflictKind::IntegrityViolation),
                        reason: format!(
                            "equal clocks {} but content hash {} != {}",
                            local.vector_clock, local.content_hash, remote.content_hash
                        ),
                        ..base
                    }
                }
            }
            ClockOrdering::Concurrent => self.resolve_concurrent(local, remote, base),
        }
    }

    fn resolve_concurrent(
        &self,
        local: &EntityMetadata,
        remote: &EntityMetadata,
        base: Resolution,
    ) -> Resolution {
        let kind = if local.deleted != remote.deleted {
            ConflictKind::DeleteUpdate
        } else {
            ConflictKind::ConcurrentUpdate
        };

        let (winner, reason) = match self.strategy {
            ConflictStrategy::Manual => {
                return Resolution {
                    outcome: ResolutionOutcome::Manual,
                    conflict: Some(kind),
                    retain_loser: true,
                    reason: "concurrent versions, manual policy".into(),
                    ..base
                };
            }
            ConflictStrategy::PriorityBased => {
                let ord = local
                    .priority()
                    .cmp(&remote.priority())
                    .then_with(|| tie_break(local, remote));
                let w = winner_from(ord);
                (
                    w,
                    format!(
                        "priority {} ({}) vs {} ({}), {} wins",
                        local.source_priority,
                        local.source,
                        remote.source_priority,
                        remote.source,
                        w.as_str()
                    ),
                )
            }
            ConflictStrategy::LastWriteWins => {
                let w = winner_from(tie_break(local, remote));
                (w, format!("last write wins, {} is newer", w.as_str()))
            }
            ConflictStrategy::ServerWins => {
                let w = if self.local_role == NodeRole::Master {
                    Winner::Local
                } else {
                    Winner::Remote
                };
                (w, format!("server wins, local role {}", self.local_role))
            }
            ConflictStrategy::ClientWins => {
                let w = if self.local_role == NodeRole::Master {
                    Winner::Remote
                } else {
                    Winner::Local
                };
                (w, format!("client wins, local role {}", self.local_role))
            }
        };

        let retain_loser = self.strategy == ConflictStrategy::PriorityBased;
        Resolution {
            outcome: match winner {
                Winner::Local => ResolutionOutcome::KeepLocal,
                Winner::Remote => ResolutionOutcome::ApplyRemote,
            },
            winner: Some(winner),
            conflict: Some(kind),
            retain_loser,
            merge_clock: true,
            reason,
            ..base
        }
    }

    /// Short form: should the remote version replace the local one?
    pub fn should_accept_remote(&self, local: &EntityMetadata, remote: &EntityMetadata) -> (bool, String) {
        let resolution = self.resolve(local, remote);
        (
            resolution.outcome == ResolutionOutcome::ApplyRemote,
            resolution.reason,
        )
    }
}

fn same_content(local: &EntityMetadata, remote: &EntityMetadata) -> bool {
    local.content_hash == remote.content_hash && local.deleted == remote.deleted
}

/// updated_at, then instance id, then content hash. Greater wins.
fn tie_break(local: &EntityMetadata, remote: &EntityMetadata) -> Ordering {
    local
        .updated_at
        .cmp(&remote.updated_at)
        .then_with(|| local.instance_id.cmp(&remote.instance_id))
        .then_with(|| local.content_hash.cmp(&remote.content_hash))
}

fn winner_from(ord: Ordering) -> Winner {
    match ord {
        Ordering::Less => Winner::Remote,
        Ordering::Greater | Ordering::Equal => Winner::Local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityType, TruthSource};
    use chrono::{Duration, Utc};

    fn meta(instance: &str, clock: VectorClock, source: TruthSource, hash: &str) -> EntityMetadata {
        let mut m = EntityMetadata::new(EntityType::Location, "Shelf A", instance);
        m.vector_clock = clock;
        m.set_source(source, None);
        m.content_hash = hash.to_string();
        m
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(ConflictStrategy::PriorityBased, NodeRole::Peer)
    }

    #[test]
    fn test_dominating_local_discards_remote() {
        let local = meta("nodeA", VectorClock::from([("nodeA", 3)]), TruthSource::Local, "x");
        let remote = meta("nodeA", VectorClock::from([("nodeA", 2)]), TruthSource::Physical, "y");
        let r = resolver().resolve(&local, &remote);
        assert_eq!(r.outcome, ResolutionOutcome::KeepLocal);
        assert!(r.conflict.is_none());
    }

    #[test]
    fn test_dominating_remote_is_applied() {
        let local = meta("nodeA", VectorClock::from([("nodeA", 2)]), TruthSource::Physical, "x");
        let remote = meta("nodeB", VectorClock::from([("nodeA", 2), ("nodeB", 1)]), TruthSource::External, "y");
        let r = resolver().resolve(&local, &remote);
        assert_eq!(r.outcome, ResolutionOutcome::ApplyRemote);
        assert_eq!(r.merged_clock, remote.vector_clock);
        assert!(!r.retain_loser);
    }

    #[test]
    fn test_equal_clocks_same_hash_is_noop() {
        let c = VectorClock::from([("nodeA", 1)]);
        let local = meta("nodeA", c.clone(), TruthSource::Local, "same");
        let remote = meta("nodeA", c, TruthSource::Local, "same");
        assert_eq!(resolver().resolve(&local, &remote).outcome, ResolutionOutcome::NoOp);
    }

    #[test]
    fn test_equal_clocks_different_hash_is_integrity_violation() {
        let c = VectorClock::from([("nodeA", 1)]);
        let local = meta("nodeA", c.clone(), TruthSource::Local, "one");
        let remote = meta("nodeA", c, TruthSource::Local, "two");
        let r = resolver().resolve(&local, &remote);
        assert_eq!(r.outcome, ResolutionOutcome::IntegrityViolation);
        assert_eq!(r.conflict, Some(ConflictKind::IntegrityViolation));
        assert!(r.winner.is_none());
    }

    #[test]
    fn test_physical_beats_local_on_both_sides() {
        let a = meta("nodeA", VectorClock::from([("nodeA", 3)]), TruthSource::Physical, "a");
        let b = meta("nodeB", VectorClock::from([("nodeB", 2)]), TruthSource::Local, "b");

        let on_a = resolver().resolve(&a, &b);
        assert_eq!(on_a.outcome, ResolutionOutcome::KeepLocal);
        let on_b = resolver().resolve(&b, &a);
        assert_eq!(on_b.outcome, ResolutionOutcome::ApplyRemote);

        let expected = VectorClock::from([("nodeA", 3), ("nodeB", 2)]);
        assert_eq!(on_a.merged_clock, expected);
        assert_eq!(on_b.merged_clock, expected);
        assert!(on_a.retain_loser && on_b.retain_loser);
    }

    #[test]
    fn test_priority_tie_uses_timestamp_then_instance() {
        let now = Utc::now();
        let mut a = meta("nodeA", VectorClock::from([("nodeA", 1)]), TruthSource::Physical, "a");
        let mut b = meta("nodeB", VectorClock::from([("nodeB", 1)]), TruthSource::Physical, "b");
        a.updated_at = now;
        b.updated_at = now + Duration::seconds(5);
        assert_eq!(resolver().resolve(&a, &b).winner, Some(Winner::Remote));
        assert_eq!(resolver().resolve(&b, &a).winner, Some(Winner::Local));

        b.updated_at = now;
        assert_eq!(resolver().resolve(&a, &b).winner, Some(Winner::Remote));
        assert_eq!(resolver().resolve(&b, &a).winner, Some(Winner::Local));
    }

    #[test]
    fn test_last_write_wins_ignores_priority() {
        let r = ConflictResolver::new(ConflictStrategy::LastWriteWins, NodeRole::Peer);
        let now = Utc::now();
        let mut a = meta("nodeA", VectorClock::from([("nodeA", 1)]), TruthSource::Physical, "a");
        let mut b = meta("nodeB", VectorClock::from([("nodeB", 1)]), TruthSource::External, "b");
        a.updated_at = now;
        b.updated_at = now + Duration::seconds(1);
        let res = r.resolve(&a, &b);
        assert_eq!(res.outcome, ResolutionOutcome::ApplyRemote);
        assert!(!res.retain_loser);
    }

    #[test]
    fn test_server_and_client_wins_follow_role() {
        let a = meta("nodeA", VectorClock::from([("nodeA", 1)]), TruthSource::Local, "a");
        let b = meta("nodeB", VectorClock::from([("nodeB", 1)]), TruthSource::Local, "b");

        let master = ConflictResolver::new(ConflictStrategy::ServerWins, NodeRole::Master);
        assert_eq!(master.resolve(&a, &b).outcome, ResolutionOutcome::KeepLocal);
        let edge = ConflictResolver::new(ConflictStrategy::ServerWins, NodeRole::Edge);
        assert_eq!(edge.resolve(&a, &b).outcome, ResolutionOutcome::ApplyRemote);
        let client = ConflictResolver::new(ConflictStrategy::ClientWins, NodeRole::Edge);
        assert_eq!(client.resolve(&a, &b).outcome, ResolutionOutcome::KeepLocal);
    }

    #[test]
    fn test_manual_applies_nothing() {
        let r = ConflictResolver::new(ConflictStrategy::Manual, NodeRole::Peer);
        let a = meta("nodeA", VectorClock::from([("nodeA", 1)]), TruthSource::Local, "a");
        let b = meta("nodeB", VectorClock::from([("nodeB", 1)]), TruthSource::Physical, "b");
        let res = r.resolve(&a, &b);
        assert_eq!(res.outcome, ResolutionOutcome::Manual);
        assert!(res.retain_loser);
        assert!(!res.merge_clock);
        assert!(!r.should_accept_remote(&a, &b).0);
    }

    #[test]
    fn test_delete_against_update_is_classified() {
        let a = meta("nodeA", VectorClock::from([("nodeA", 1)]), TruthSource::Local, "a");
        let mut b = meta("nodeB", VectorClock::from([("nodeB", 1)]), TruthSource::Local, "b");
        b.tombstone();
        assert_eq!(resolver().resolve(&a, &b).conflict, Some(ConflictKind::DeleteUpdate));
    }
}
