//! Application configuration
//!
//! Sections deserialize from an optional JSON file; every field has a
//! default so a partial file (or none) is valid. Binaries apply CLI overrides
//! on top and call [`AppConfig::validate`] before starting anything.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::EngineError;
use crate::execution::{ExecutionConfig, ExecutionMode};
use crate::feed::FeedConfig;
use crate::runner::RunnerConfig;
use crate::sync::PersistenceConfig;
use crate::trading_core::{SessionConfig, TradingCalendar};
use crate::ws::{ClientConfig, ServerConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub runner: RunnerConfig,
    pub session: SessionConfig,
    pub persistence: PersistenceConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub execution: ExecutionConfig,
    pub feed: FeedConfig,
}

impl AppConfig {
    pub fn load_json(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// File at `path` if given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load_json(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| Err(EngineError::Config(msg.to_string()));

        if self.runner.symbol.trim().is_empty() {
            return invalid("runner.symbol must not be empty");
        }
        if self.runner.poll_interval_secs == 0 {
            return invalid("runner.poll_interval_secs must be positive");
        }
        if self.runner.lookback_candles < 2 {
            return invalid("runner.lookback_candles must be at least 2");
        }
        if self.runner.missed_threshold_secs <= 0 {
            return invalid("runner.missed_threshold_secs must be positive");
        }
        if self.persistence.snapshot_interval_mins == 0 {
            return invalid("persistence.snapshot_interval_mins must be positive");
        }
        if self.persistence.snapshot_retention == 0 {
            return invalid("persistence.snapshot_retention must be at least 1");
        }
        if self.server.heartbeat_interval_secs == 0 {
            return invalid("server.heartbeat_interval_secs must be positive");
        }
        if self.server.heartbeat_timeout() < self.server.heartbeat_interval() {
            return invalid("server.heartbeat_timeout_secs must be at least the heartbeat interval");
        }
        if self.server.client_queue == 0 {
            return invalid("server.client_queue must be positive");
        }
        if self.client.reconnect_interval_ms == 0 || self.client.keepalive_interval_secs == 0 {
            return invalid("client intervals must be positive");
        }
        if self.client.max_backoff_ms < self.client.reconnect_interval_ms {
            return invalid("client.max_backoff_ms must be at least client.reconnect_interval_ms");
        }
        if self.execution.quantity == 0 {
            return invalid("execution.quantity must be positive");
        }
        if self.execution.strike_step <= 0.0 {
            return invalid("execution.strike_step must be positive");
        }
        if self.execution.mode == ExecutionMode::Webhook && self.execution.webhook_url.is_none() {
            return invalid("execution.webhook_url is required in webhook mode");
        }

        TradingCalendar::from_config(&self.session)
            .map_err(|e| EngineError::Config(format!("session: {:#}", e)))?;
        Ok(())
    }
}
