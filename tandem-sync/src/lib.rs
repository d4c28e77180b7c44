//! # tandem-sync — Multi-client CRDT document sync
//!
//! Clients join a room by opening `ws://host:port/<room>`. The server keeps
//! one merged document per room, relays edits and presence between the
//! room's clients, and forgets the room when the last client leaves.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer   │
//! │ (per user)  │    Binary Proto    │ (accept loop)│
//! └──────┬──────┘                    └──────┬───────┘
//!        │                                  │ one task per socket
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌──────────────┐
//! │ Document    │                    │ RoomRegistry │
//! │ (replica)   │                    │ (lazy rooms) │
//! └─────────────┘                    └──────┬───────┘
//!                                           │
//!                                   ┌───────┴───────┐
//!                                   │ Room          │
//!                                   │ doc+awareness │
//!                                   │ BroadcastGroup│
//!                                   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (tag byte + payload)
//! - [`document`] — Mergeable document capability, Yrs-backed by default
//! - [`awareness`] — Presence table with per-client clocks
//! - [`broadcast`] — Room fan-out with lag accounting
//! - [`room`] — One shared document and its connected clients
//! - [`registry`] — Lazy room creation and removal
//! - [`gateway`] — Room id selection during the WebSocket upgrade
//! - [`server`] — Accept loop, configuration and statistics
//! - [`client`] — WebSocket sync client with a local replica

pub mod awareness;
pub mod broadcast;
pub mod client;
mod connection;
pub mod document;
pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use awareness::{AwarenessRecord, AwarenessTable};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
pub use connection::ConnectionError;
pub use document::{DocumentState, MergeError, YrsDocument};
pub use gateway::GatewayError;
pub use protocol::{AwarenessEntry, AwarenessUpdate, MessageType, ProtocolError, SyncMessage};
pub use registry::{RegistryError, RoomRegistry};
pub use room::{ConnectionId, Departure, Joined, Room, RoomError};
pub use server::{ConfigError, ServerConfig, ServerError, ServerStats, SyncServer};
