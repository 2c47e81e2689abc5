//! Inside bar detection
//!
//! An inside bar is a candle whose high and low sit strictly within the
//! preceding ("mother") candle. The mother candle's high/low become the
//! breakout range of the resulting signal.

use chrono::{DateTime, Utc};

use super::lifecycle::Signal;
use super::session::TradingCalendar;
use crate::types::Candle;

/// One containment match between adjacent candles
#[derive(Debug, Clone, PartialEq)]
pub struct InsideBar {
    /// Open boundary of the inside (defining) candle
    pub defining_candle_ts: DateTime<Utc>,
    /// High of the mother candle
    pub range_high: f64,
    /// Low of the mother candle
    pub range_low: f64,
    /// Whether the defining candle belongs to the current session
    pub in_session: bool,
}

impl InsideBar {
    pub fn width(&self) -> f64 {
        self.range_high - self.range_low
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatternDetector {
    calendar: TradingCalendar,
}

impl PatternDetector {
    pub fn new(calendar: TradingCalendar) -> Self {
        Self { calendar }
    }

    pub fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }

    /// Best inside-bar signal among the supplied candles, if any
    pub fn detect(&self, candles: &[Candle], now: DateTime<Utc>) -> Option<Signal> {
        self.detect_after(candles, now, None)
    }

    /// Like [`detect`](Self::detect), but ignores defining candles at or
    /// before `after`
    pub fn detect_after(
        &self,
        candles: &[Candle],
        now: DateTime<Utc>,
        after: Option<DateTime<Utc>>,
    ) -> Option<Signal> {
        let matches: Vec<InsideBar> = self
            .scan(candles, now)
            .into_iter()
            .filter(|m| after.map_or(true, |cutoff| m.defining_candle_ts > cutoff))
            .collect();

        select_best(&matches).map(|best| Signal::from_inside_bar(best, now))
    }

    /// All containment matches in chronological order
    pub fn scan(&self, candles: &[Candle], now: DateTime<Utc>) -> Vec<InsideBar> {
        if candles.len() < 2 {
            return Vec::new();
        }

        candles
            .windows(2)
            .filter_map(|pair| {
                let (prev, cur) = (&pair[0], &pair[1]);
                if cur.high < prev.high && cur.low > prev.low {
                    Some(InsideBar {
                        defining_candle_ts: cur.timestamp,
                        range_high: prev.high,
                        range_low: prev.low,
                        in_session: self.calendar.in_current_session(cur.timestamp, now),
                    })
                } else {
                    None
                }
            })
            .collect()
    }
}

/// In-session matches win; among them the narrowest range, equal widths
/// resolved to the most recent defining candle. Without an in-session match
/// the most recent match is used.
fn select_best(matches: &[InsideBar]) -> Option<&InsideBar> {
    let in_session = matches.iter().filter(|m| m.in_session).fold(None, |best: Option<&InsideBar>, m| {
        match best {
            None => Some(m),
            Some(b) if m.width() < b.width() => Some(m),
            Some(b) if m.width() == b.width() && m.defining_candle_ts > b.defining_candle_ts => Some(m),
            keep => keep,
        }
    });

    in_session.or_else(|| matches.iter().max_by_key(|m| m.defining_candle_ts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use chrono::{Duration, TimeZone};

    // Monday 2026-03-02 10:00 ET
    fn session_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap()
    }

    fn candles(hl: &[(f64, f64)]) -> Vec<Candle> {
        hl.iter()
            .enumerate()
            .map(|(i, &(h, l))| {
                let ts = session_start() + Duration::minutes(5 * i as i64);
                Candle::new(ts, (h + l) / 2.0, h, l, (h + l) / 2.0, 100)
            })
            .collect()
    }

    fn now_after(candles: &[Candle]) -> DateTime<Utc> {
        candles.last().unwrap().timestamp + Duration::minutes(6)
    }

    #[test]
    fn test_requires_two_candles() {
        let detector = PatternDetector::default();
        assert!(detector.detect(&[], session_start()).is_none());

        let one = candles(&[(100.0, 90.0)]);
        assert!(detector.detect(&one, now_after(&one)).is_none());
    }

    #[test]
    fn test_basic_inside_bar() {
        let detector = PatternDetector::default();
        let bars = candles(&[(100.0, 90.0), (98.0, 92.0)]);

        let signal = detector.detect(&bars, now_after(&bars)).unwrap();
        assert_eq!(signal.range_high, 100.0);
        assert_eq!(signal.range_low, 90.0);
        assert_eq!(signal.defining_candle_ts, bars[1].timestamp);
        assert_eq!(signal.direction, Direction::Undetermined);
    }

    #[test]
    fn test_containment_is_strict() {
        let detector = PatternDetector::default();

        // Equal high is not contained
        let bars = candles(&[(100.0, 90.0), (100.0, 92.0)]);
        assert!(detector.detect(&bars, now_after(&bars)).is_none());

        // Equal low is not contained
        let bars = candles(&[(100.0, 90.0), (98.0, 90.0)]);
        assert!(detector.detect(&bars, now_after(&bars)).is_none());
    }

    #[test]
    fn test_independent_of_price_scale() {
        let detector = PatternDetector::default();
        for scale in [0.001, 1.0, 25_000.0] {
            let bars = candles(&[(100.0 * scale, 90.0 * scale), (98.0 * scale, 92.0 * scale)]);
            let signal = detector.detect(&bars, now_after(&bars)).unwrap();
            assert_eq!(signal.range_high, 100.0 * scale);
            assert_eq!(signal.range_low, 90.0 * scale);
        }
    }

    #[test]
    fn test_prefers_narrowest_in_session() {
        let detector = PatternDetector::default();
        // Match at index 1 has width 10 (mother 100/90), match at index 3 has width 20
        let bars = candles(&[
            (100.0, 90.0),
            (98.0, 92.0),
            (110.0, 90.0),
            (105.0, 95.0),
        ]);

        let signal = detector.detect(&bars, now_after(&bars)).unwrap();
        assert_eq!(signal.defining_candle_ts, bars[1].timestamp);
        assert_eq!(signal.range_high - signal.range_low, 10.0);
    }

    #[test]
    fn test_equal_width_prefers_most_recent() {
        let detector = PatternDetector::default();
        let bars = candles(&[
            (100.0, 90.0),
            (98.0, 92.0),
            (200.0, 190.0),
            (198.0, 192.0),
        ]);

        let signal = detector.detect(&bars, now_after(&bars)).unwrap();
        assert_eq!(signal.defining_candle_ts, bars[3].timestamp);
        assert_eq!(signal.range_high, 200.0);
    }

    #[test]
    fn test_prefers_in_session_over_narrower_previous_session() {
        let detector = PatternDetector::default();
        let yesterday = session_start() - Duration::days(1);
        let mut bars = vec![
            Candle::new(yesterday, 100.0, 100.0, 99.0, 99.5, 10),
            Candle::new(yesterday + Duration::minutes(5), 99.5, 99.8, 99.2, 99.5, 10),
        ];
        bars.extend(candles(&[(120.0, 100.0), (115.0, 105.0)]));

        let signal = detector.detect(&bars, now_after(&bars)).unwrap();
        assert_eq!(signal.range_high, 120.0);
        assert_eq!(signal.range_low, 100.0);
    }

    #[test]
    fn test_falls_back_to_most_recent_outside_session() {
        let detector = PatternDetector::default();
        let bars = candles(&[(100.0, 90.0), (98.0, 92.0), (110.0, 80.0), (105.0, 85.0)]);
        // Evaluated the next day: nothing is in the current session
        let now = session_start() + Duration::days(1);

        let signal = detector.detect(&bars, now).unwrap();
        assert_eq!(signal.defining_candle_ts, bars[3].timestamp);
    }

    #[test]
    fn test_detect_after_skips_consumed_candles() {
        let detector = PatternDetector::default();
        let bars = candles(&[(100.0, 90.0), (98.0, 92.0), (110.0, 80.0), (105.0, 85.0)]);
        let now = now_after(&bars);

        let signal = detector.detect_after(&bars, now, Some(bars[1].timestamp)).unwrap();
        assert_eq!(signal.defining_candle_ts, bars[3].timestamp);

        assert!(detector.detect_after(&bars, now, Some(bars[3].timestamp)).is_none());
    }
}
