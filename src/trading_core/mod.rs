//! Trading Core - inside bar breakout strategy
//!
//! This module contains the signal state machine components:
//! - Trading session calendar
//! - Inside bar pattern detection
//! - Breakout / missed-trade confirmation
//! - Signal lifecycle management

pub mod session;
pub mod pattern;
pub mod breakout;
pub mod lifecycle;

// Re-export commonly used types
pub use session::{SessionConfig, TradingCalendar};
pub use pattern::{InsideBar, PatternDetector};
pub use breakout::{BreakoutConfirmer, Confirmation, DEFAULT_MISSED_THRESHOLD_SECS};
pub use lifecycle::{LifecycleEvent, Signal, SignalLifecycleManager, SignalStatus};
