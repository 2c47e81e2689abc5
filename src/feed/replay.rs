//! Recorded candles served back through the feed interface

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::info;

use super::{normalize, CandleFeed};
use crate::types::{Candle, Timeframe};

/// Serves a fixed candle set; only candles closed by `to` are returned, so a
/// runner driven with a moving clock sees history unfold.
pub struct ReplayCandleFeed {
    candles: Vec<Candle>,
}

impl ReplayCandleFeed {
    pub fn new(mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.timestamp);
        Self { candles }
    }

    /// Load a JSON array of candles; `.zst` files are decompressed first
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let json = if path.extension().is_some_and(|ext| ext == "zst") {
            zstd::decode_all(&raw[..])?
        } else {
            raw
        };
        let candles: Vec<Candle> = serde_json::from_slice(&json)
            .with_context(|| format!("Failed to parse candles in {}", path.display()))?;

        info!(path = %path.display(), candles = candles.len(), "Loaded replay candles");
        Ok(Self::new(candles))
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

#[async_trait]
impl CandleFeed for ReplayCandleFeed {
    async fn get_candles(
        &self,
        _symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let window = self
            .candles
            .iter()
            .filter(|c| c.timestamp >= from && c.timestamp <= to)
            .cloned()
            .collect();
        Ok(normalize(window, timeframe, to))
    }
}
