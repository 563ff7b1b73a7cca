//! # Repository Module
//!
//! One repository per durable sync table.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Caller                                                                │
//! │     │   db.metadata().get(EntityType::Location, "Shelf A")             │
//! │     ▼                                                                   │
//! │  MetadataRepository                                                    │
//! │     ├── get / get_in                   read                            │
//! │     ├── upsert / upsert_in             write, optionally inside a tx   │
//! │     └── changed_since                  pull query                      │
//! │     │                                                                   │
//! │     ▼   runtime sqlx::query_as + FromRow row struct                    │
//! │  SQLite                                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Methods ending in `_in` take a `&mut SqliteConnection` so that several of
//! them can share one `sqlx::Transaction`.
//!
//! ## Available Repositories
//!
//! - [`RecordRepository`] - replicated JSON payloads
//! - [`MetadataRepository`] - entity metadata and tombstones
//! - [`ChecksumRepository`] - checksum tree nodes
//! - [`QueueRepository`] - debounced outbound queue
//! - [`ConflictRepository`] - retained conflict artifacts
//! - [`RouteRepository`] - route health
//! - [`WatermarkRepository`] - per route/type progress
//! - [`RelayPacketRepository`] - blind relay envelopes

pub mod checksums;
pub mod conflicts;
pub mod metadata;
pub mod queue;
pub mod records;
pub mod relay;
pub mod routes;
pub mod watermarks;

pub use checksums::{ChecksumRepository, StoredChecksum};
pub use conflicts::ConflictRepository;
pub use metadata::{ChangeQuery, MetadataRepository};
pub use queue::{Enqueue, QueueRepository};
pub use records::RecordRepository;
pub use relay::RelayPacketRepository;
pub use routes::RouteRepository;
pub use watermarks::{CycleReport, WatermarkRepository};

use chrono::{DateTime, Utc};
use std::str::FromStr;

use crate::error::{DbError, DbResult};

// =============================================================================
// Column Helpers
// =============================================================================

/// Timestamps are stored as unix microseconds.
pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(column: &'static str, micros: i64) -> DbResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| DbError::corrupt(column, format!("timestamp out of range: {micros}")))
}

pub(crate) fn opt_from_micros(
    column: &'static str,
    micros: Option<i64>,
) -> DbResult<Option<DateTime<Utc>>> {
    micros.map(|m| from_micros(column, m)).transpose()
}

/// Parses a stored enum string.
pub(crate) fn parse_column<T>(column: &'static str, value: &str) -> DbResult<T>
where
    T: FromStr,
    T::Err: ToString,
{
    value.parse::<T>().map_err(|e| DbError::corrupt(column, e))
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    column: &'static str,
    value: &str,
) -> DbResult<T> {
    serde_json::from_str(value).map_err(|e| DbError::corrupt(column, e))
}
