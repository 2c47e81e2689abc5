//! State synchronization layer
//!
//! - `event_bus`: in-process topic pub/sub
//! - `state_store`: versioned path-addressable state, publishes `state.*`
//! - `persistence`: snapshots + append-only event log with replay
//! - `topic`: shared `*` / `prefix.*` pattern matching

pub mod event_bus;
pub mod persistence;
pub mod state_store;
pub mod topic;

pub use event_bus::{Event, EventBus, EventBusStats, SubscriptionId};
pub use persistence::{LogRecord, PersistenceConfig, RestoreReport, StatePersistence};
pub use state_store::{
    ListenerId, StateEntry, StatePath, StateReading, StateSnapshot, StateStore, StateValue,
    STATE_TOPIC_PREFIX,
};
