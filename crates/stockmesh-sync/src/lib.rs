//! # stockmesh-sync: Mesh Sync Engine and Blind Relay
//!
//! Keeps warehouse nodes converged without a central coordinator. Local
//! writes go through the interceptor (clock tick, checksum, queue); remote
//! records go through the inbound applier (clock comparison, resolver,
//! integrity check). The engine moves records between the two over the
//! authenticated HTTP mesh.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Node Architecture                                │
//! │                                                                         │
//! │   local caller                               remote peer                │
//! │        │                                          │                     │
//! │        ▼                                          ▼                     │
//! │  ┌────────────────┐                      ┌────────────────┐            │
//! │  │WriteInterceptor│                      │  MeshServer    │            │
//! │  │ clock++ hash   │                      │  (axum)        │            │
//! │  │ queue entry    │                      │  auth per call │            │
//! │  └───────┬────────┘                      └───┬───────┬────┘            │
//! │          │                                   │       │                  │
//! │          ▼                                   ▼       ▼                  │
//! │  ┌────────────────┐  pull/push/negotiate ┌────────┐ ┌──────────────┐   │
//! │  │  SyncEngine    │◄────────────────────►│Exchange│ │InboundApplier│   │
//! │  │ scheduler      │   MeshTransport      │Service │ │ resolver     │   │
//! │  │ realtime queue │   (IPv4 pinned)      └────────┘ └──────────────┘   │
//! │  │ health, relay  │                                                     │
//! │  └───────┬────────┘                                                     │
//! │          │ sealed envelopes                                             │
//! │          ▼                                                              │
//! │  ┌────────────────┐                                                     │
//! │  │  Blind relay   │  stores ciphertext only, never decrypts             │
//! │  └────────────────┘                                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - Node, route, entity and relay configuration
//! - [`error`] - Sync error types
//! - [`protocol`] - Wire types for the mesh HTTP API
//! - [`auth`] - Signed mesh tokens and caller authentication
//! - [`interceptor`] - Local write path
//! - [`inbound`] - Remote apply path
//! - [`exchange`] - Server-side pull, negotiation and checksum queries
//! - [`transport`] - HTTP client for one peer
//! - [`connection`] - Route selection, failover and health
//! - [`registry`] - Known peers
//! - [`engine`] - Orchestrator and background loops
//! - [`server`] - Mesh HTTP server
//! - [`relay`] - Envelope sealing, relay storage and relay client
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stockmesh_sync::{MeshServer, SyncConfig, SyncEngine};
//!
//! let config = SyncConfig::load_or_default(None);
//! let engine = Arc::new(SyncEngine::new(config, db).await?);
//! let server = MeshServer::new(engine.clone()).start("0.0.0.0:8090").await?;
//! let handle = engine.start().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod auth;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod inbound;
pub mod interceptor;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth::MeshAuth;
pub use config::{EntitySyncConfig, RouteConfig, SyncConfig};
pub use connection::{ConnectionManager, RouteState};
pub use engine::{
    CycleSummary, EngineState, MaintenanceReport, NoOpEmitter, SyncEngine, SyncEngineHandle,
    SyncEventEmitter, SyncStatus,
};
pub use error::{SyncError, SyncResult};
pub use exchange::ExchangeService;
pub use inbound::{ApplyOutcome, BatchReport, InboundApplier, Origin};
pub use interceptor::{WriteContext, WriteHook, WriteInterceptor};
pub use protocol::{ApplyStatus, NodeInfo, PullRequest, PullResponse, PushRequest, WireRecord};
pub use registry::PeerRegistry;
pub use relay::{RelayClient, RelayStore, SecurityLayer};
pub use server::{MeshServer, MeshServerHandle};
pub use transport::{MeshTransport, TransportConfig};
