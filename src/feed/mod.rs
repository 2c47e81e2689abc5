//! Candle sources consumed by the live runner
//!
//! - `HttpCandleFeed`: polls a market-data REST endpoint
//! - `ReplayCandleFeed`: serves recorded candles from memory or a file

mod http;
mod replay;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::types::{Candle, Timeframe};

pub use http::HttpCandleFeed;
pub use replay::ReplayCandleFeed;

/// Source of OHLC candles for one symbol and timeframe
#[async_trait]
pub trait CandleFeed: Send + Sync {
    /// Candles whose open boundary lies in `[from, to]`, oldest first
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// REST endpoint base, e.g. `http://localhost:8080`
    pub base_url: Option<String>,
    /// JSON or `.json.zst` candle file to replay instead of polling
    pub replay_file: Option<PathBuf>,
    pub request_timeout_secs: Option<u64>,
}

impl FeedConfig {
    /// Build the configured feed; a replay file wins over a URL
    pub fn build(&self) -> Result<Arc<dyn CandleFeed>> {
        if let Some(path) = &self.replay_file {
            return Ok(Arc::new(ReplayCandleFeed::from_file(path)?));
        }
        if let Some(url) = &self.base_url {
            let timeout = std::time::Duration::from_secs(self.request_timeout_secs.unwrap_or(10));
            return Ok(Arc::new(HttpCandleFeed::new(url, timeout)?));
        }
        bail!("no candle feed configured (set feed.base_url or feed.replay_file)")
    }
}

/// Sort by open boundary, drop duplicates (last one wins) and candles that
/// have not closed by `now`
pub fn normalize(mut candles: Vec<Candle>, timeframe: Timeframe, now: DateTime<Utc>) -> Vec<Candle> {
    candles.sort_by_key(|c| c.timestamp);

    let mut out: Vec<Candle> = Vec::with_capacity(candles.len());
    for candle in candles {
        if !candle.is_closed(timeframe, now) {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.timestamp == candle.timestamp => *last = candle,
            _ => out.push(candle),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_normalize_sorts_dedupes_and_drops_open_candle() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap();
        let at = |i: i64, close: f64| Candle::new(t0 + Duration::minutes(5 * i), close, close, close, close, 0);

        let candles = vec![at(2, 3.0), at(0, 1.0), at(1, 2.0), at(1, 2.5), at(3, 4.0)];
        let now = t0 + Duration::minutes(17);

        let out = normalize(candles, Timeframe::M5, now);
        let closes: Vec<f64> = out.iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![1.0, 2.5, 3.0]);
    }

    #[test]
    fn test_build_requires_a_source() {
        assert!(FeedConfig::default().build().is_err());
    }
}
