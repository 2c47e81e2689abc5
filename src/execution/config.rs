//! Configuration for order execution

use serde::{Deserialize, Serialize};

/// Execution mode determines whether orders leave the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Simulated execution (no actual orders)
    #[default]
    Simulation,
    /// POST each order to `webhook_url`
    Webhook,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulation => write!(f, "Simulation"),
            Self::Webhook => write!(f, "Webhook"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simulation" | "sim" => Ok(Self::Simulation),
            "webhook" => Ok(Self::Webhook),
            other => anyhow::bail!("unknown execution mode '{}'", other),
        }
    }
}

/// Configuration for the execution collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,

    /// Contracts per order
    pub quantity: u32,

    /// Strike increment the breakout close is rounded to
    pub strike_step: f64,

    /// Order endpoint for webhook mode
    pub webhook_url: Option<String>,

    pub request_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Simulation,
            quantity: 1,
            strike_step: 1.0,
            webhook_url: None,
            request_timeout_secs: 10,
        }
    }
}
