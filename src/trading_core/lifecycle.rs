//! Signal lifecycle: `NoSignal → Active → {Confirmed, Missed, Superseded} → NoSignal`
//!
//! The manager owns the single active signal. Each cycle it first resolves the
//! active signal against the latest candles, then looks for a newer candidate
//! that may create or supersede a signal. Discarded signals are never revived:
//! candidates must be defined after every discarded signal's defining candle,
//! and after the breakout candle that resolved a signal.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::breakout::BreakoutConfirmer;
use super::pattern::{InsideBar, PatternDetector};
use crate::types::{Candle, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Active,
    Confirmed,
    Missed,
    Superseded,
}

/// Inside-bar signal awaiting (or resolved by) a breakout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub direction: Direction,
    pub range_high: f64,
    pub range_low: f64,
    /// Open boundary of the inside candle
    pub defining_candle_ts: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: SignalStatus,
}

impl Signal {
    pub fn new(
        range_high: f64,
        range_low: f64,
        defining_candle_ts: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction: Direction::Undetermined,
            range_high,
            range_low,
            defining_candle_ts,
            created_at,
            status: SignalStatus::Active,
        }
    }

    pub(crate) fn from_inside_bar(bar: &InsideBar, now: DateTime<Utc>) -> Self {
        Self::new(bar.range_high, bar.range_low, bar.defining_candle_ts, now)
    }

    pub fn width(&self) -> f64 {
        self.range_high - self.range_low
    }
}

/// Transition reported by [`SignalLifecycleManager::evaluate`]
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Created(Signal),
    Superseded {
        previous: Signal,
        replacement: Signal,
    },
    /// Breakout in time; the caller issues the execution request
    Confirmed {
        signal: Signal,
        candle: Candle,
    },
    /// Breakout discovered too late; no execution
    Missed {
        signal: Signal,
        candle: Candle,
        elapsed: Duration,
    },
}

impl LifecycleEvent {
    /// Event bus topic for this transition
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Created(_) => "signal.created",
            Self::Superseded { .. } => "signal.superseded",
            Self::Confirmed { .. } => "signal.confirmed",
            Self::Missed { .. } => "signal.missed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed { .. } | Self::Missed { .. })
    }

    pub fn to_payload(&self) -> serde_json::Value {
        match self {
            Self::Created(signal) => serde_json::json!({ "signal": signal }),
            Self::Superseded {
                previous,
                replacement,
            } => serde_json::json!({ "previous": previous, "replacement": replacement }),
            Self::Confirmed { signal, candle } => {
                serde_json::json!({ "signal": signal, "candle": candle })
            }
            Self::Missed {
                signal,
                candle,
                elapsed,
            } => serde_json::json!({
                "signal": signal,
                "candle": candle,
                "elapsed_secs": elapsed.num_seconds(),
            }),
        }
    }
}

pub struct SignalLifecycleManager {
    detector: PatternDetector,
    confirmer: BreakoutConfirmer,
    active: Option<Signal>,
    /// Newest defining or breakout candle of any discarded signal
    watermark: Option<DateTime<Utc>>,
}

impl SignalLifecycleManager {
    pub fn new(detector: PatternDetector, confirmer: BreakoutConfirmer) -> Self {
        Self {
            detector,
            confirmer,
            active: None,
            watermark: None,
        }
    }

    pub fn active(&self) -> Option<&Signal> {
        self.active.as_ref()
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// Restore the active signal and watermark after a restart
    pub fn resume(&mut self, signal: Option<Signal>, watermark: Option<DateTime<Utc>>) {
        self.watermark = watermark;
        self.active = signal.filter(|s| s.status == SignalStatus::Active);
    }

    fn advance_watermark(&mut self, ts: DateTime<Utc>) {
        self.watermark = Some(self.watermark.map_or(ts, |w| w.max(ts)));
    }

    /// Run one lifecycle pass over the latest closed candles
    pub fn evaluate(&mut self, candles: &[Candle], now: DateTime<Utc>) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();

        if let Some(terminal) = self.resolve_active(candles, now) {
            events.push(terminal);
        }

        let Some(candidate) = self.detector.detect_after(candles, now, self.watermark) else {
            return events;
        };

        match self.active.take() {
            None => {
                info!(
                    "Inside bar signal created: range {:.2}-{:.2} (defining candle {})",
                    candidate.range_low, candidate.range_high, candidate.defining_candle_ts
                );
                self.active = Some(candidate.clone());
                events.push(LifecycleEvent::Created(candidate));
            }
            Some(current) if self.supersedes(&candidate, &current, now) => {
                info!(
                    "Signal {} superseded: {:.2}-{:.2} -> {:.2}-{:.2}",
                    current.id,
                    current.range_low,
                    current.range_high,
                    candidate.range_low,
                    candidate.range_high
                );
                let mut previous = current;
                previous.status = SignalStatus::Superseded;
                self.advance_watermark(previous.defining_candle_ts);
                self.active = Some(candidate.clone());
                events.push(LifecycleEvent::Superseded {
                    previous,
                    replacement: candidate,
                });
            }
            Some(current) => {
                self.active = Some(current);
            }
        }

        events
    }

    fn resolve_active(&mut self, candles: &[Candle], now: DateTime<Utc>) -> Option<LifecycleEvent> {
        let signal = self.active.as_ref()?;
        let confirmation = self.confirmer.confirm(candles, signal, now);

        let (Some(direction), Some(candle)) = (confirmation.direction, confirmation.candle) else {
            debug!("Signal {} still inside range", signal.id);
            return None;
        };

        let mut signal = self.active.take()?;
        signal.direction = direction;
        // Older inside bars whose range this candle already broke stay dead too
        self.advance_watermark(candle.timestamp);

        if confirmation.is_missed {
            let elapsed = now - candle.close_time(self.confirmer.timeframe());
            signal.status = SignalStatus::Missed;
            info!(
                "Missed {} breakout for signal {}: candle closed {}s ago",
                direction,
                signal.id,
                elapsed.num_seconds()
            );
            Some(LifecycleEvent::Missed {
                signal,
                candle,
                elapsed,
            })
        } else {
            signal.status = SignalStatus::Confirmed;
            info!(
                "Confirmed {} breakout for signal {} at close {:.2}",
                direction, signal.id, candle.close
            );
            Some(LifecycleEvent::Confirmed { signal, candle })
        }
    }

    fn supersedes(&self, candidate: &Signal, current: &Signal, now: DateTime<Utc>) -> bool {
        if candidate.defining_candle_ts == current.defining_candle_ts {
            return false;
        }

        let calendar = self.detector.calendar();
        let candidate_in = calendar.in_current_session(candidate.defining_candle_ts, now);
        let current_in = calendar.in_current_session(current.defining_candle_ts, now);

        match (candidate_in, current_in) {
            (true, false) => true,
            (true, true) => {
                candidate.width() < current.width()
                    || (candidate.width() == current.width()
                        && candidate.defining_candle_ts > current.defining_candle_ts)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap()
    }

    fn bar(i: i64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(t0() + Duration::minutes(5 * i), close, high, low, close, 10)
    }

    fn closed_at(candle: &Candle) -> DateTime<Utc> {
        candle.close_time(Timeframe::M5)
    }

    fn manager() -> SignalLifecycleManager {
        SignalLifecycleManager::new(PatternDetector::default(), BreakoutConfirmer::default())
    }

    #[test]
    fn test_create_then_confirm_clears_active() {
        let mut mgr = manager();
        let mut bars = vec![bar(0, 100.0, 90.0, 95.0), bar(1, 98.0, 92.0, 95.0)];

        let events = mgr.evaluate(&bars, closed_at(&bars[1]));
        assert!(matches!(events.as_slice(), [LifecycleEvent::Created(_)]));
        assert!(mgr.active().is_some());

        bars.push(bar(2, 102.0, 96.0, 101.0));
        let events = mgr.evaluate(&bars, closed_at(&bars[2]) + Duration::seconds(30));

        match events.as_slice() {
            [LifecycleEvent::Confirmed { signal, candle }] => {
                assert_eq!(signal.direction, Direction::Bullish);
                assert_eq!(signal.status, SignalStatus::Confirmed);
                assert_eq!(candle.close, 101.0);
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert!(mgr.active().is_none());
    }

    #[test]
    fn test_missed_breakout_clears_active() {
        let mut mgr = manager();
        let mut bars = vec![bar(0, 100.0, 90.0, 95.0), bar(1, 98.0, 92.0, 95.0)];
        mgr.evaluate(&bars, closed_at(&bars[1]));

        bars.push(bar(2, 96.0, 85.0, 86.0));
        let events = mgr.evaluate(&bars, closed_at(&bars[2]) + Duration::minutes(10));

        match events.as_slice() {
            [LifecycleEvent::Missed { signal, elapsed, .. }] => {
                assert_eq!(signal.direction, Direction::Bearish);
                assert_eq!(signal.status, SignalStatus::Missed);
                assert_eq!(*elapsed, Duration::minutes(10));
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert!(mgr.active().is_none());
    }

    #[test]
    fn test_discarded_signal_not_revived() {
        let mut mgr = manager();
        let mut bars = vec![bar(0, 100.0, 90.0, 95.0), bar(1, 98.0, 92.0, 95.0)];
        mgr.evaluate(&bars, closed_at(&bars[1]));

        bars.push(bar(2, 102.0, 96.0, 101.0));
        let now = closed_at(&bars[2]);
        assert_eq!(mgr.evaluate(&bars, now).len(), 1);

        // Same candles again: the consumed inside bar must not come back
        assert!(mgr.evaluate(&bars, now + Duration::seconds(10)).is_empty());
        assert!(mgr.active().is_none());
    }

    #[test]
    fn test_terminal_then_new_signal_same_cycle() {
        let mut mgr = manager();
        let mut bars = vec![bar(0, 100.0, 90.0, 95.0), bar(1, 98.0, 92.0, 95.0)];
        mgr.evaluate(&bars, closed_at(&bars[1]));

        // Breakout candle followed by an inside bar of the breakout candle
        bars.push(bar(2, 104.0, 96.0, 103.0));
        bars.push(bar(3, 103.0, 98.0, 100.0));
        let events = mgr.evaluate(&bars, closed_at(&bars[3]));

        assert_eq!(events.len(), 2);
        assert!(events[0].is_terminal());
        match &events[1] {
            LifecycleEvent::Created(signal) => {
                assert_eq!(signal.range_high, 104.0);
                assert_eq!(signal.range_low, 96.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_narrower_candidate_supersedes() {
        let mut mgr = manager();
        let mut bars = vec![bar(0, 110.0, 90.0, 100.0), bar(1, 108.0, 92.0, 100.0)];
        mgr.evaluate(&bars, closed_at(&bars[1]));
        let first = mgr.active().unwrap().clone();

        // Inside bar of the inside bar: narrower mother range 108/92
        bars.push(bar(2, 105.0, 95.0, 100.0));
        let events = mgr.evaluate(&bars, closed_at(&bars[2]));

        match events.as_slice() {
            [LifecycleEvent::Superseded {
                previous,
                replacement,
            }] => {
                assert_eq!(previous.id, first.id);
                assert_eq!(previous.status, SignalStatus::Superseded);
                assert_eq!(replacement.range_high, 108.0);
                assert_eq!(replacement.range_low, 92.0);
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert_eq!(mgr.active().unwrap().range_high, 108.0);
    }

    #[test]
    fn test_breakout_candle_retires_older_ranges() {
        let mut mgr = manager();
        let mut bars = vec![bar(0, 100.0, 90.0, 95.0), bar(1, 98.0, 92.0, 95.0)];
        mgr.evaluate(&bars, closed_at(&bars[1]));

        // Wider inside bar (80-99) that does not replace the active 90-100
        bars.push(bar(2, 99.0, 80.0, 94.0));
        bars.push(bar(3, 98.0, 85.0, 93.0));
        assert!(mgr.evaluate(&bars, closed_at(&bars[3])).is_empty());

        // One candle breaks both ranges
        bars.push(bar(4, 102.0, 95.0, 101.0));
        let now = closed_at(&bars[4]) + Duration::seconds(30);
        let events = mgr.evaluate(&bars, now);

        assert!(matches!(events.as_slice(), [LifecycleEvent::Confirmed { .. }]));
        assert!(mgr.active().is_none());
        assert_eq!(mgr.watermark(), Some(bars[4].timestamp));

        // Next cycle must not confirm the 80-99 range on the same candle
        assert!(mgr.evaluate(&bars, now + Duration::seconds(10)).is_empty());
        assert!(mgr.active().is_none());
    }

    #[test]
    fn test_in_session_candidate_replaces_previous_session_signal() {
        let mut mgr = manager();
        // Friday 2026-02-27 14:00 ET
        let friday = Utc.with_ymd_and_hms(2026, 2, 27, 19, 0, 0).unwrap();
        let fri = |i: i64, high: f64, low: f64, close: f64| {
            Candle::new(friday + Duration::minutes(5 * i), close, high, low, close, 10)
        };
        let mut bars = vec![fri(0, 100.0, 95.0, 97.0), fri(1, 99.0, 96.0, 97.0)];
        mgr.evaluate(&bars, closed_at(&bars[1]));
        let stale = mgr.active().unwrap().clone();
        assert_eq!(stale.width(), 5.0);

        // Monday: wider inside bar, closes stay inside 95-100
        bars.push(bar(0, 103.0, 92.0, 97.0));
        bars.push(bar(1, 101.0, 94.0, 98.0));
        let events = mgr.evaluate(&bars, closed_at(&bars[3]));

        match events.as_slice() {
            [LifecycleEvent::Superseded {
                previous,
                replacement,
            }] => {
                assert_eq!(previous.id, stale.id);
                assert_eq!(replacement.range_high, 103.0);
                assert_eq!(replacement.range_low, 92.0);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_equal_width_newer_candidate_supersedes() {
        let mut mgr = manager();
        let mut bars = vec![bar(0, 100.0, 90.0, 95.0), bar(1, 98.0, 92.0, 95.0)];
        mgr.evaluate(&bars, closed_at(&bars[1]));
        let first = mgr.active().unwrap().clone();

        // 94-104 mother: same width, newer, closes stay inside 90-100
        bars.push(bar(2, 104.0, 94.0, 99.0));
        bars.push(bar(3, 103.0, 95.0, 98.0));
        let events = mgr.evaluate(&bars, closed_at(&bars[3]));

        match events.as_slice() {
            [LifecycleEvent::Superseded {
                previous,
                replacement,
            }] => {
                assert_eq!(previous.id, first.id);
                assert_eq!(replacement.range_low, 94.0);
                assert_eq!(replacement.width(), first.width());
                assert_eq!(replacement.defining_candle_ts, bars[3].timestamp);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_wider_candidate_does_not_supersede() {
        let mut mgr = manager();
        let mut bars = vec![bar(0, 100.0, 90.0, 95.0), bar(1, 98.0, 92.0, 95.0)];
        mgr.evaluate(&bars, closed_at(&bars[1]));
        let first = mgr.active().unwrap().clone();

        // A new, wider inside bar whose closes never leave the first range
        bars.push(bar(2, 99.0, 80.0, 94.0));
        bars.push(bar(3, 98.0, 85.0, 93.0));
        let now = closed_at(&bars[3]);
        // candidates after the active one are wider, detector keeps the narrowest
        let events = mgr.evaluate(&bars, now);

        assert!(events.is_empty());
        assert_eq!(mgr.active().unwrap().id, first.id);
    }
}
