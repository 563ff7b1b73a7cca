//! # stockmesh-core: Pure Synchronization Primitives
//!
//! Types and algorithms shared by every node of the warehouse mesh. Nothing
//! in this crate touches a database, a socket or the file system.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        stockmesh Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 apps/stockmesh-node (binary)                    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │        stockmesh-sync: engine, server, transport, relay         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │        stockmesh-db: SQLite repositories, migrations            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ stockmesh-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │  vector_clock  checksum  merkle  conflict  metadata  filter     │   │
//! │  │                                                                 │   │
//! │  │        NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`vector_clock`] - Causal ordering of versions
//! - [`types`] - Entity types, truth sources, roles and policies
//! - [`metadata`] - Per-entity sync record
//! - [`checksum`] - Content hashes and the checksum tree
//! - [`merkle`] - Bucketed hash tree for set reconciliation
//! - [`conflict`] - Conflict resolver
//! - [`filter`] - Record filters for the `filtered` strategy
//! - [`records`] - Rows of the durable sync tables
//! - [`error`] - Error types
//!
//! ## Example
//!
//! ```rust
//! use stockmesh_core::{ClockOrdering, VectorClock};
//!
//! let mut a = VectorClock::new();
//! a.increment("nodeA");
//! let mut b = a.clone();
//! b.increment("nodeB");
//!
//! assert_eq!(a.compare(&b), ClockOrdering::Dominated);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod checksum;
pub mod conflict;
pub mod error;
pub mod filter;
pub mod merkle;
pub mod metadata;
pub mod records;
pub mod types;
pub mod vector_clock;

// =============================================================================
// Re-exports
// =============================================================================

pub use checksum::{ChecksumCalculator, ChecksumEntity};
pub use conflict::{ConflictKind, ConflictResolver, Resolution, ResolutionOutcome, Winner};
pub use error::{CoreError, CoreResult};
pub use filter::{FilterOperator, SyncFilter};
pub use merkle::{MerkleDiff, MerkleTree};
pub use metadata::EntityMetadata;
pub use records::{EncryptedPacket, EntityRecord, QueueEntry, RouteRecord, SyncConflict, Watermark};
pub use types::*;
pub use vector_clock::{ClockOrdering, VectorClock};

/// Days a tombstone is kept before it may be purged.
pub const DEFAULT_TOMBSTONE_TTL_DAYS: i64 = 30;

/// Hours an envelope may wait on a blind relay.
pub const DEFAULT_RELAY_PACKET_TTL_HOURS: i64 = 168;
