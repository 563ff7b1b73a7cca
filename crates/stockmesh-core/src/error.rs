//! # Error Types
//!
//! Error types for stockmesh-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  stockmesh-core errors (this file)                                     │
//! │  └── CoreError        - Parsing and validation of sync primitives      │
//! │                                                                         │
//! │  stockmesh-db errors (separate crate)                                  │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  stockmesh-sync errors (separate crate)                                │
//! │  └── SyncError        - Transport, protocol, integrity failures        │
//! │                                                                         │
//! │  Flow: CoreError → DbError / SyncError → HTTP status on the wire       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Errors raised by the pure sync primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A vector clock failed validation.
    ///
    /// ## When This Occurs
    /// - An entry has an empty node id
    /// - An entry has a negative counter (only possible through bad input)
    #[error("Invalid vector clock: {0}")]
    InvalidVectorClock(String),

    /// Unknown entity type string.
    #[error("Unknown entity type: '{0}'")]
    UnknownEntityType(String),

    /// Unknown truth source string.
    #[error("Unknown truth source: '{0}'")]
    UnknownTruthSource(String),

    /// Unknown enum value for a named setting (role, strategy, policy...).
    #[error("Unknown {kind}: '{value}'. Valid options: {valid}")]
    UnknownVariant {
        kind: &'static str,
        value: String,
        valid: &'static str,
    },

    /// A record filter could not be evaluated.
    #[error("Invalid filter on '{field}': {reason}")]
    InvalidFilter { field: String, reason: String },

    /// Canonical serialization of an entity failed.
    #[error("Failed to serialize entity for hashing: {0}")]
    Serialization(String),
}

impl CoreError {
    pub(crate) fn unknown(kind: &'static str, value: &str, valid: &'static str) -> Self {
        CoreError::UnknownVariant {
            kind,
            value: value.to_string(),
            valid,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_variant_message() {
        let err = CoreError::unknown("node role", "boss", "master, peer, edge, blind_relay");
        let msg = err.to_string();
        assert!(msg.contains("node role"));
        assert!(msg.contains("boss"));
        assert!(msg.contains("blind_relay"));
    }
}
