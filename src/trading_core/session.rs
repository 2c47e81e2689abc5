//! Trading session calendar
//!
//! Session hours are evaluated in the exchange's local timezone, Monday to
//! Friday, with an explicit holiday list.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Session hours as read from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// IANA timezone name of the exchange
    pub timezone: String,
    /// Session open, local time (HH:MM)
    pub open: String,
    /// Session close, local time (HH:MM), exclusive
    pub close: String,
    /// Exchange holidays (YYYY-MM-DD)
    pub holidays: Vec<NaiveDate>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timezone: "America/New_York".to_string(),
            open: "09:30".to_string(),
            close: "16:00".to_string(),
            holidays: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradingCalendar {
    timezone: Tz,
    open: NaiveTime,
    close: NaiveTime,
    holidays: BTreeSet<NaiveDate>,
}

impl Default for TradingCalendar {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::New_York,
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
            holidays: BTreeSet::new(),
        }
    }
}

impl TradingCalendar {
    pub fn new(timezone: Tz, open: NaiveTime, close: NaiveTime) -> Self {
        Self {
            timezone,
            open,
            close,
            holidays: BTreeSet::new(),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let timezone: Tz = config
            .timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("unknown timezone '{}': {}", config.timezone, e))?;
        let open = NaiveTime::parse_from_str(&config.open, "%H:%M")
            .with_context(|| format!("invalid session open '{}'", config.open))?;
        let close = NaiveTime::parse_from_str(&config.close, "%H:%M")
            .with_context(|| format!("invalid session close '{}'", config.close))?;

        if open >= close {
            anyhow::bail!("session open {} must be before close {}", open, close);
        }

        Ok(Self {
            timezone,
            open,
            close,
            holidays: config.holidays.iter().copied().collect(),
        })
    }

    pub fn with_holidays(mut self, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(holidays);
        self
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// Session date of `ts`, if it falls inside session hours
    pub fn session_date(&self, ts: DateTime<Utc>) -> Option<NaiveDate> {
        let local = ts.with_timezone(&self.timezone);
        let date = local.date_naive();
        let time = local.time();

        if self.is_trading_day(date) && time >= self.open && time < self.close {
            Some(date)
        } else {
            None
        }
    }

    /// Whether the market is open at `now`
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.session_date(now).is_some()
    }

    /// Whether `ts` belongs to the session that `now` is in (or, outside
    /// hours, the session of `now`'s local date)
    pub fn in_current_session(&self, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let today = now.with_timezone(&self.timezone).date_naive();
        self.session_date(ts) == Some(today)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // 2026-03-02 is a Monday; New York is on EST (UTC-5) until March 8
    fn et(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour + 5, minute, 0).unwrap()
    }

    #[test]
    fn test_session_hours() {
        let cal = TradingCalendar::default();

        assert!(!cal.is_open(et(2, 9, 29)));
        assert!(cal.is_open(et(2, 9, 30)));
        assert!(cal.is_open(et(2, 15, 59)));
        assert!(!cal.is_open(et(2, 16, 0)));
    }

    #[test]
    fn test_weekend_and_holiday_closed() {
        let cal = TradingCalendar::default()
            .with_holidays([NaiveDate::from_ymd_opt(2026, 3, 3).unwrap()]);

        // Saturday
        assert!(!cal.is_open(et(7, 10, 0)));
        // Holiday Tuesday
        assert!(!cal.is_open(et(3, 10, 0)));
        // Regular Wednesday
        assert!(cal.is_open(et(4, 10, 0)));
    }

    #[test]
    fn test_in_current_session() {
        let cal = TradingCalendar::default();
        let now = et(3, 11, 0);

        assert!(cal.in_current_session(et(3, 9, 45), now));
        assert!(!cal.in_current_session(et(2, 15, 0), now));
        // Pre-market candle is outside the session
        assert!(!cal.in_current_session(et(3, 8, 0), now));
    }

    #[test]
    fn test_from_config() {
        let config = SessionConfig {
            timezone: "Asia/Kolkata".to_string(),
            open: "09:15".to_string(),
            close: "15:30".to_string(),
            holidays: vec![],
        };
        let cal = TradingCalendar::from_config(&config).unwrap();
        assert_eq!(cal.timezone(), chrono_tz::Asia::Kolkata);

        let bad = SessionConfig {
            open: "16:00".to_string(),
            close: "09:00".to_string(),
            ..Default::default()
        };
        assert!(TradingCalendar::from_config(&bad).is_err());
    }
}
