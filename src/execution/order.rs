//! Order request handed to the execution collaborator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Direction;

/// Option side implied by the breakout direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Calls for bullish breakouts, puts for bearish; nothing otherwise
    pub fn for_direction(direction: Direction) -> Option<Self> {
        match direction {
            Direction::Bullish => Some(Self::Call),
            Direction::Bearish => Some(Self::Put),
            Direction::Undetermined => None,
        }
    }
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "CALL"),
            Self::Put => write!(f, "PUT"),
        }
    }
}

/// Round `price` to the nearest multiple of `step`
pub fn strike_for(price: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return price;
    }
    (price / step).round() * step
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-side id, also the idempotency key for the broker
    pub id: Uuid,
    pub signal_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub option_type: OptionType,
    pub strike: f64,
    pub quantity: u32,
    pub created_at: DateTime<Utc>,
}

impl OrderRequest {
    /// Build a request from a confirmed breakout; `None` for an undetermined
    /// direction
    pub fn from_breakout(
        signal_id: Uuid,
        symbol: &str,
        direction: Direction,
        breakout_close: f64,
        strike_step: f64,
        quantity: u32,
    ) -> Option<Self> {
        let option_type = OptionType::for_direction(direction)?;
        Some(Self {
            id: Uuid::new_v4(),
            signal_id,
            symbol: symbol.to_string(),
            direction,
            option_type,
            strike: strike_for(breakout_close, strike_step),
            quantity,
            created_at: Utc::now(),
        })
    }
}

/// Broker acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default = "Utc::now")]
    pub accepted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strike_rounding() {
        assert_eq!(strike_for(101.3, 1.0), 101.0);
        assert_eq!(strike_for(101.6, 1.0), 102.0);
        assert_eq!(strike_for(512.4, 5.0), 510.0);
        assert_eq!(strike_for(512.6, 5.0), 515.0);
        assert_eq!(strike_for(99.9, 0.0), 99.9);
    }

    #[test]
    fn test_request_from_breakout() {
        let signal_id = Uuid::new_v4();
        let request = OrderRequest::from_breakout(signal_id, "SPY", Direction::Bearish, 498.7, 1.0, 2).unwrap();
        assert_eq!(request.option_type, OptionType::Put);
        assert_eq!(request.strike, 499.0);
        assert_eq!(request.quantity, 2);
        assert_eq!(request.signal_id, signal_id);

        assert!(OrderRequest::from_breakout(signal_id, "SPY", Direction::Undetermined, 1.0, 1.0, 1).is_none());
    }
}
