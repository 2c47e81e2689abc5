//! Failure taxonomy shared across the engine
//!
//! Plumbing code propagates `anyhow::Error`; these variants classify the
//! failures that are surfaced to observers as `errors.*` topics.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Candle feed could not be read; the cycle is abandoned
    #[error("candle fetch failed: {0}")]
    DataFetch(String),

    /// Broker rejected or never acknowledged the order
    #[error("order execution failed: {0}")]
    OrderExecution(String),

    /// Snapshot or event log write failed; memory stays authoritative
    #[error("persistence write failed: {0}")]
    PersistenceWrite(String),

    #[error("invalid state path '{0}'")]
    InvalidPath(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Event bus topic used to surface this failure
    pub fn topic(&self) -> &'static str {
        match self {
            Self::DataFetch(_) => "errors.data_fetch",
            Self::OrderExecution(_) => "errors.order_execution",
            Self::PersistenceWrite(_) => "system.persistence.error",
            Self::InvalidPath(_) => "errors.invalid_path",
            Self::Protocol(_) => "errors.protocol",
            Self::Config(_) => "errors.config",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::DataFetch(_) => "data_fetch",
            Self::OrderExecution(_) => "order_execution",
            Self::PersistenceWrite(_) => "persistence_write",
            Self::InvalidPath(_) => "invalid_path",
            Self::Protocol(_) => "protocol",
            Self::Config(_) => "config",
        }
    }

    /// Payload published alongside the topic
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }
}
