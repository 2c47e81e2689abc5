//! Breakout confirmation for an active inside-bar signal

use chrono::{DateTime, Duration, Utc};

use super::lifecycle::Signal;
use crate::types::{Candle, Direction, Timeframe};

/// Default age after which a breakout is considered missed
pub const DEFAULT_MISSED_THRESHOLD_SECS: i64 = 300;

/// Outcome of a confirmation pass
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub direction: Option<Direction>,
    pub candle: Option<Candle>,
    pub is_missed: bool,
}

impl Confirmation {
    pub fn none() -> Self {
        Self {
            direction: None,
            candle: None,
            is_missed: false,
        }
    }

    pub fn is_breakout(&self) -> bool {
        self.direction.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct BreakoutConfirmer {
    timeframe: Timeframe,
    missed_threshold: Duration,
}

impl Default for BreakoutConfirmer {
    fn default() -> Self {
        Self::new(Timeframe::default(), Duration::seconds(DEFAULT_MISSED_THRESHOLD_SECS))
    }
}

impl BreakoutConfirmer {
    pub fn new(timeframe: Timeframe, missed_threshold: Duration) -> Self {
        Self {
            timeframe,
            missed_threshold,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn missed_threshold(&self) -> Duration {
        self.missed_threshold
    }

    /// Scan candles after the signal's defining candle for the first close
    /// outside its range. Candles that have not closed by `now` are ignored.
    pub fn confirm(&self, candles: &[Candle], signal: &Signal, now: DateTime<Utc>) -> Confirmation {
        for candle in candles
            .iter()
            .filter(|c| c.timestamp > signal.defining_candle_ts)
        {
            let close_time = candle.close_time(self.timeframe);
            if close_time > now {
                continue;
            }

            let direction = if candle.close > signal.range_high {
                Direction::Bullish
            } else if candle.close < signal.range_low {
                Direction::Bearish
            } else {
                continue;
            };

            return Confirmation {
                direction: Some(direction),
                candle: Some(candle.clone()),
                is_missed: now - close_time > self.missed_threshold,
            };
        }

        Confirmation::none()
    }
}
