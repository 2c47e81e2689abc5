//! Execution module for orders raised by confirmed breakouts
//!
//! The runner only depends on [`OrderExecutor`]; adapters decide where the
//! order goes (simulated locally or posted to a webhook).

mod config;
mod engine;
mod order;

pub use config::{ExecutionConfig, ExecutionMode};
pub use engine::{build_executor, OrderExecutor, SimulatedExecutor, WebhookExecutor};
pub use order::{strike_for, OptionType, OrderAck, OrderRequest};
