//! WebSocket bridge between the engine's event bus and remote observers
//!
//! - `protocol`: JSON frame types and heartbeat constants
//! - `server`: axum server pushing snapshots and events to connections
//! - `client`: reconnecting client keeping a mirrored state store

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ClientConfig, ClientCounters, ClientStatus, WsClient};
pub use protocol::{ClientCommand, ServerMessage, WireMessage};
pub use server::{ConnectionId, ConnectionInfo, ConnectionRegistry, ServerConfig, WsServer};
