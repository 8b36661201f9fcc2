//! # quire-sync — Real-time collaborative document sync engine
//!
//! Many clients edit one shared text document over WebSocket; every
//! replica converges to the same text regardless of delivery order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ Gateway          │
//! │ (Replica)   │     Binary Proto    │ (auth, pump)     │
//! └─────────────┘                     └────────┬─────────┘
//!                                              │
//!                     ┌────────────────────────┼──────────────────┐
//!                     ▼                        ▼                  ▼
//!              ┌─────────────┐        ┌────────────────┐  ┌──────────────┐
//!              │ Session     │        │ DocumentRoom   │  │ Persistence  │
//!              │ Registry    │        │ engine+causal  │─►│ Bridge       │
//!              └─────────────┘        └───────┬────────┘  └──────┬───────┘
//!                                             │                  │
//!                                     ┌───────┴───────┐   ┌──────┴───────┐
//!                                     │ BroadcastGroup│   │ RocksStore / │
//!                                     │ (fan-out)     │   │ MemoryStore  │
//!                                     └───────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`crdt`] — Version vectors and the replicated text type
//! - [`causal`] — Holds updates until their dependencies arrive
//! - [`engine`] — Authoritative per-document state
//! - [`session`] — Who is attached where, heartbeats, pruning
//! - [`gateway`] — Per-connection state machine
//! - [`broadcast`] — Per-document fan-out with lag detection
//! - [`storage`] — Durable snapshots with retry
//! - [`server`] — Wiring, maintenance tasks, health, shutdown
//! - [`client`] — WebSocket client with offline queue

pub mod auth;
pub mod broadcast;
pub mod causal;
pub mod client;
pub mod config;
pub mod crdt;
pub mod documents;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

pub type DocumentId = uuid::Uuid;
pub type SessionId = uuid::Uuid;

// Re-exports for convenience
pub use auth::{
    AccessOracle, AccessRule, HmacTokenVerifier, Role, StaticAccessOracle, TokenVerifier, UserId,
};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use causal::{CausalBuffer, CausalConfig};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use config::ServerConfig;
pub use crdt::{Diff, Replica, ReplicaId, Update, VersionVector};
pub use documents::{DocumentRegistry, DocumentRoom, FlushReport};
pub use engine::{ApplyOutcome, DocumentEngine};
pub use error::{ErrorKind, SyncError};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use server::{HealthReport, HealthStatus, ServerStats, SyncServer};
pub use session::{Session, SessionRegistry};
pub use storage::{MemoryStore, PersistenceBridge, RocksStore, StateStore, StoreConfig};
