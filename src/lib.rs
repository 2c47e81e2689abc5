// Library crate - inside-bar signal engine and its state synchronization layer

pub mod config;
pub mod error;
pub mod execution;
pub mod feed;
pub mod runner;
pub mod sync;
pub mod trading_core;
pub mod types;
pub mod ws;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::EngineError;
pub use runner::{LiveRunner, RunnerConfig, RunnerStats};
pub use types::*;
