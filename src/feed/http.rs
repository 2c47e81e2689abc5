//! REST candle feed
//!
//! `GET {base}/candles?symbol=..&timeframe=..&from=..&to=..` returning a JSON
//! array of candles (or `{"candles": [...]}`).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{normalize, CandleFeed};
use crate::types::{Candle, Timeframe};

#[derive(Deserialize)]
#[serde(untagged)]
enum CandleResponse {
    Bare(Vec<Candle>),
    Wrapped { candles: Vec<Candle> },
}

pub struct HttpCandleFeed {
    client: Client,
    base_url: String,
}

impl HttpCandleFeed {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CandleFeed for HttpCandleFeed {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let response = self
            .client
            .get(format!("{}/candles", self.base_url))
            .query(&[
                ("symbol", symbol.to_string()),
                ("timeframe", timeframe.to_string()),
                ("from", from.to_rfc3339()),
                ("to", to.to_rfc3339()),
            ])
            .send()
            .await
            .context("Failed to send candle request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Candle request failed with status {}: {}", status, body));
        }

        let candles = match response
            .json::<CandleResponse>()
            .await
            .context("Failed to parse candle response")?
        {
            CandleResponse::Bare(c) => c,
            CandleResponse::Wrapped { candles } => candles,
        };

        let received = candles.len();
        let candles = normalize(candles, timeframe, to);
        debug!(symbol, %timeframe, received, complete = candles.len(), "Fetched candles");
        Ok(candles)
    }
}
