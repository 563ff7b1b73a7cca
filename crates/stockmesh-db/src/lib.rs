//! # stockmesh-db: SQLite Persistence for the Sync Mesh
//!
//! Every durable piece of sync state lives here: replicated payloads, entity
//! metadata, checksum tree nodes, the outbound queue, conflicts, route health,
//! watermarks and blind relay envelopes.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  stockmesh-sync (interceptor, applier, engine, server, relay)          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  stockmesh-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────────┐   ┌────────────────────┐   ┌─────────────┐  │   │
//! │  │   │  Database    │   │  Repositories      │   │ Migrations  │  │   │
//! │  │   │  (pool.rs)   │◄──│  records metadata  │   │ (embedded)  │  │   │
//! │  │   │  SqlitePool  │   │  checksums queue   │   │ 0001_sync   │  │   │
//! │  │   │  begin()     │   │  conflicts routes  │   │             │  │   │
//! │  │   │              │   │  watermarks relay  │   │             │  │   │
//! │  │   └──────────────┘   └────────────────────┘   └─────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (WAL)                                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stockmesh_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("node.db")).await?;
//! let meta = db.metadata().get(EntityType::Location, "Shelf A").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::{
    ChangeQuery, ChecksumRepository, ConflictRepository, CycleReport, Enqueue, MetadataRepository,
    QueueRepository, RecordRepository, RelayPacketRepository, RouteRepository, StoredChecksum,
    WatermarkRepository,
};

/// Re-exported so callers can name the connection type of `*_in` methods.
pub use sqlx::SqliteConnection;
