//! Execution collaborators - where confirmed breakouts become orders
//!
//! The runner awaits one `place_order` per confirmation and never retries;
//! a failure is surfaced and the signal is discarded either way.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::config::{ExecutionConfig, ExecutionMode};
use super::order::{OrderAck, OrderRequest};

#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    /// Short label for logs
    fn name(&self) -> &str;
}

/// Build the executor selected by `config.mode`
pub fn build_executor(config: &ExecutionConfig) -> Result<Arc<dyn OrderExecutor>> {
    match config.mode {
        ExecutionMode::Simulation => Ok(Arc::new(SimulatedExecutor::new())),
        ExecutionMode::Webhook => {
            let url = config
                .webhook_url
                .as_deref()
                .ok_or_else(|| anyhow!("execution.webhook_url is required in webhook mode"))?;
            Ok(Arc::new(WebhookExecutor::new(
                url,
                Duration::from_secs(config.request_timeout_secs),
            )?))
        }
    }
}

/// Accepts every order locally with `SIM_<n>` ids
#[derive(Default)]
pub struct SimulatedExecutor {
    order_counter: AtomicU64,
    placed: Mutex<Vec<OrderRequest>>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Orders accepted so far, oldest first
    pub fn placed(&self) -> Vec<OrderRequest> {
        self.placed.lock().clone()
    }
}

#[async_trait]
impl OrderExecutor for SimulatedExecutor {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let n = self.order_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let order_id = format!("SIM_{}", n);

        info!(
            "SIMULATION: {} {} {} {:.2} x{} -> {}",
            request.direction, request.symbol, request.option_type, request.strike, request.quantity, order_id
        );
        self.placed.lock().push(request.clone());

        Ok(OrderAck {
            order_id,
            accepted_at: chrono::Utc::now(),
        })
    }

    fn name(&self) -> &str {
        "simulation"
    }
}

/// POSTs the request as JSON and expects `{"order_id": ...}` back
pub struct WebhookExecutor {
    client: Client,
    url: String,
}

impl WebhookExecutor {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl OrderExecutor for WebhookExecutor {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        debug!(url = %self.url, id = %request.id, "Posting order");

        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .context("Failed to send order request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Order rejected with status {}: {}", status, body);
        }

        let ack: OrderAck = response.json().await.context("Failed to parse order response")?;
        info!(order_id = %ack.order_id, strike = request.strike, "Order accepted");
        Ok(ack)
    }

    fn name(&self) -> &str {
        "webhook"
    }
}
