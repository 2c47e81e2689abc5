//! Live runner - polls candles and drives the signal lifecycle
//!
//! One cooperative loop on a single task. It is the only writer of signal
//! state, so cycles never overlap. Every transition is committed to the
//! state store first and published as a domain event second.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::execution::{ExecutionConfig, OrderExecutor, OrderRequest};
use crate::feed::{normalize, CandleFeed};
use crate::sync::{EventBus, StateStore, StateValue};
use crate::trading_core::{
    BreakoutConfirmer, LifecycleEvent, PatternDetector, Signal, SignalLifecycleManager,
    TradingCalendar, DEFAULT_MISSED_THRESHOLD_SECS,
};
use crate::types::{Candle, Timeframe};

/// State paths written by the runner
pub mod paths {
    pub const SIGNAL_ACTIVE: &str = "signal.active";
    pub const SIGNAL_LAST_OUTCOME: &str = "signal.last_outcome";
    pub const SIGNAL_WATERMARK: &str = "signal.watermark";
    pub const ORDERS_LAST: &str = "orders.last";
    pub const ORDERS_COUNT: &str = "orders.count";
    pub const RUNNER_LAST_CYCLE_AT: &str = "runner.last_cycle_at";
    pub const RUNNER_STATUS: &str = "runner.status";
    pub const RUNNER_LAST_ERROR: &str = "runner.last_error";
}

const SOURCE: &str = "runner";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub poll_interval_secs: u64,
    /// Candles of history fetched each cycle
    pub lookback_candles: u32,
    pub missed_threshold_secs: i64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            symbol: "SPY".to_string(),
            timeframe: Timeframe::M5,
            poll_interval_secs: 10,
            lookback_candles: 78, // one regular session of 5m candles
            missed_threshold_secs: DEFAULT_MISSED_THRESHOLD_SECS,
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub skipped: bool,
    pub fetch_failed: bool,
    pub candles: usize,
    /// Domain topics published, in order
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub cycles: u64,
    pub skipped_cycles: u64,
    pub fetch_failures: u64,
    pub signals_created: u64,
    pub signals_superseded: u64,
    pub signals_confirmed: u64,
    pub signals_missed: u64,
    pub orders_placed: u64,
    pub orders_failed: u64,
}

pub struct LiveRunner {
    config: RunnerConfig,
    execution: ExecutionConfig,
    calendar: TradingCalendar,
    lifecycle: SignalLifecycleManager,
    feed: Arc<dyn CandleFeed>,
    executor: Arc<dyn OrderExecutor>,
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    stats: RunnerStats,
}

impl LiveRunner {
    pub fn new(
        config: RunnerConfig,
        execution: ExecutionConfig,
        calendar: TradingCalendar,
        feed: Arc<dyn CandleFeed>,
        executor: Arc<dyn OrderExecutor>,
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        let lifecycle = SignalLifecycleManager::new(
            PatternDetector::new(calendar.clone()),
            BreakoutConfirmer::new(config.timeframe, Duration::seconds(config.missed_threshold_secs)),
        );

        Self {
            config,
            execution,
            calendar,
            lifecycle,
            feed,
            executor,
            store,
            bus,
            stats: RunnerStats::default(),
        }
    }

    pub fn stats(&self) -> &RunnerStats {
        &self.stats
    }

    pub fn active_signal(&self) -> Option<&Signal> {
        self.lifecycle.active()
    }

    /// Pick up the active signal and watermark left in the store by a
    /// previous run (after persistence restore)
    pub fn resume_from_store(&mut self) {
        let signal = self
            .store
            .get(paths::SIGNAL_ACTIVE)
            .and_then(|r| r.value.as_json().cloned())
            .and_then(|v| serde_json::from_value::<Signal>(v).ok());

        let watermark = self
            .store
            .get(paths::SIGNAL_WATERMARK)
            .and_then(|r| r.value.as_str().map(str::to_string))
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|ts| ts.with_timezone(&Utc));

        if let Some(signal) = &signal {
            info!(
                "Resuming signal {}: range {:.2}-{:.2}",
                signal.id, signal.range_low, signal.range_high
            );
        }
        self.lifecycle.resume(signal, watermark);
    }

    /// Poll until `stop` flips. A cycle in progress always completes.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> Result<RunnerStats> {
        self.resume_from_store();
        self.store.update(paths::RUNNER_STATUS, "running")?;

        let period = std::time::Duration::from_secs(self.config.poll_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            symbol = %self.config.symbol,
            timeframe = %self.config.timeframe,
            poll_secs = period.as_secs(),
            executor = self.executor.name(),
            "Live runner started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }

            if let Err(e) = self.run_cycle(Utc::now()).await {
                error!("Cycle failed: {:#}", e);
                self.store.update(paths::RUNNER_LAST_ERROR, format!("{:#}", e))?;
            }
        }

        self.store.update(paths::RUNNER_STATUS, "stopped")?;
        info!(
            cycles = self.stats.cycles,
            skipped = self.stats.skipped_cycles,
            orders = self.stats.orders_placed,
            "Live runner stopped"
        );
        Ok(self.stats.clone())
    }

    /// One poll/detect/confirm pass as of `now`
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        if !self.calendar.is_open(now) {
            self.stats.skipped_cycles += 1;
            report.skipped = true;
            debug!("Outside trading session, skipping cycle");
            return Ok(report);
        }
        self.stats.cycles += 1;

        let candles = match self.fetch(now).await {
            Ok(c) => c,
            Err(e) => {
                self.stats.fetch_failures += 1;
                report.fetch_failed = true;
                let failure = EngineError::DataFetch(format!("{:#}", e));
                warn!("{}", failure);
                self.store.update(paths::RUNNER_LAST_ERROR, failure.to_string())?;
                self.publish(failure.topic(), failure.to_payload(), &mut report);
                return Ok(report);
            }
        };
        report.candles = candles.len();

        let watermark_before = self.lifecycle.watermark();
        for event in self.lifecycle.evaluate(&candles, now) {
            self.apply(event, &mut report).await?;
        }

        if let Some(watermark) = self.lifecycle.watermark() {
            if Some(watermark) != watermark_before {
                self.store.update(paths::SIGNAL_WATERMARK, watermark.to_rfc3339())?;
            }
        }

        self.store.update(paths::RUNNER_LAST_CYCLE_AT, now.to_rfc3339())?;
        self.store.update(paths::RUNNER_STATUS, "running")?;
        debug!(candles = report.candles, published = report.topics.len(), "Cycle complete");
        Ok(report)
    }

    async fn fetch(&self, now: DateTime<Utc>) -> Result<Vec<Candle>> {
        let tf = self.config.timeframe;
        let from = now - tf.duration() * self.config.lookback_candles as i32;
        let candles = self.feed.get_candles(&self.config.symbol, tf, from, now).await?;
        Ok(normalize(candles, tf, now))
    }

    async fn apply(&mut self, event: LifecycleEvent, report: &mut CycleReport) -> Result<()> {
        match &event {
            LifecycleEvent::Created(signal) => {
                self.stats.signals_created += 1;
                self.store.update(paths::SIGNAL_ACTIVE, serde_json::to_value(signal)?)?;
            }
            LifecycleEvent::Superseded { previous, replacement } => {
                self.stats.signals_superseded += 1;
                self.store.update(paths::SIGNAL_ACTIVE, serde_json::to_value(replacement)?)?;
                self.store.update(paths::SIGNAL_LAST_OUTCOME, serde_json::to_value(previous)?)?;
            }
            LifecycleEvent::Confirmed { .. } | LifecycleEvent::Missed { .. } => {
                if matches!(event, LifecycleEvent::Confirmed { .. }) {
                    self.stats.signals_confirmed += 1;
                } else {
                    self.stats.signals_missed += 1;
                }
                self.store.update(paths::SIGNAL_ACTIVE, StateValue::Null)?;
                self.store.update(paths::SIGNAL_LAST_OUTCOME, event.to_payload())?;
            }
        }

        self.publish(event.topic(), event.to_payload(), report);

        if let LifecycleEvent::Confirmed { signal, candle } = &event {
            self.execute(signal, candle, report).await?;
        }
        Ok(())
    }

    /// Hand a confirmed breakout to the executor. No retry: the signal is
    /// already discarded whatever the outcome.
    async fn execute(&mut self, signal: &Signal, candle: &Candle, report: &mut CycleReport) -> Result<()> {
        let Some(request) = OrderRequest::from_breakout(
            signal.id,
            &self.config.symbol,
            signal.direction,
            candle.close,
            self.execution.strike_step,
            self.execution.quantity,
        ) else {
            warn!("Confirmed signal {} has no direction, not executing", signal.id);
            return Ok(());
        };

        match self.executor.place_order(&request).await {
            Ok(ack) => {
                self.stats.orders_placed += 1;
                let count = self
                    .store
                    .get(paths::ORDERS_COUNT)
                    .and_then(|r| r.value.as_i64())
                    .unwrap_or(0)
                    + 1;
                let placed = serde_json::json!({ "request": request, "ack": ack });
                self.store.update(paths::ORDERS_LAST, placed.clone())?;
                self.store.update(paths::ORDERS_COUNT, count)?;
                info!(
                    order_id = %ack.order_id,
                    "Order placed: {} {} strike {:.2} x{}",
                    request.symbol, request.option_type, request.strike, request.quantity
                );
                self.publish("order.placed", placed, report);
            }
            Err(e) => {
                self.stats.orders_failed += 1;
                let failure = EngineError::OrderExecution(format!("{:#}", e));
                error!(signal = %signal.id, "{}", failure);
                self.store.update(paths::RUNNER_LAST_ERROR, failure.to_string())?;
                self.publish(
                    "order.failed",
                    serde_json::json!({ "request": request, "error": failure.to_string() }),
                    report,
                );
                self.publish(failure.topic(), failure.to_payload(), report);
            }
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: serde_json::Value, report: &mut CycleReport) {
        self.bus.publish(topic, payload, SOURCE);
        report.topics.push(topic.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{OrderAck, SimulatedExecutor};
    use crate::feed::ReplayCandleFeed;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    struct FailingFeed;

    #[async_trait]
    impl CandleFeed for FailingFeed {
        async fn get_candles(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<Candle>> {
            anyhow::bail!("connection refused")
        }
    }

    struct RejectingExecutor;

    #[async_trait]
    impl OrderExecutor for RejectingExecutor {
        async fn place_order(&self, _request: &OrderRequest) -> Result<OrderAck> {
            anyhow::bail!("insufficient buying power")
        }

        fn name(&self) -> &str {
            "rejecting"
        }
    }

    /// Monday 2026-03-02 10:00 ET
    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap()
    }

    fn bar(i: i64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(t0() + Duration::minutes(5 * i), close, high, low, close, 10)
    }

    /// Mother, inside bar, bullish breakout closing at 101.4
    fn breakout_candles() -> Vec<Candle> {
        vec![
            bar(0, 100.0, 90.0, 95.0),
            bar(1, 98.0, 92.0, 95.0),
            bar(2, 101.5, 96.0, 101.4),
        ]
    }

    struct Harness {
        runner: LiveRunner,
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        topics: Arc<Mutex<Vec<String>>>,
    }

    fn harness(feed: Arc<dyn CandleFeed>, executor: Arc<dyn OrderExecutor>) -> Harness {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(StateStore::with_bus(bus.clone()));
        let topics = Arc::new(Mutex::new(Vec::new()));

        let seen = topics.clone();
        bus.subscribe("*", move |e| {
            seen.lock().push(e.topic.clone());
            Ok(())
        });

        let runner = LiveRunner::new(
            RunnerConfig::default(),
            ExecutionConfig::default(),
            TradingCalendar::default(),
            feed,
            executor,
            store.clone(),
            bus.clone(),
        );

        Harness {
            runner,
            store,
            bus,
            topics,
        }
    }

    #[tokio::test]
    async fn test_outside_session_publishes_nothing() {
        let mut h = harness(
            Arc::new(ReplayCandleFeed::new(breakout_candles())),
            Arc::new(SimulatedExecutor::new()),
        );

        // Saturday
        let saturday = Utc.with_ymd_and_hms(2026, 3, 7, 15, 0, 0).unwrap();
        let report = h.runner.run_cycle(saturday).await.unwrap();

        assert!(report.skipped);
        assert_eq!(h.bus.stats().published, 0);
        assert!(h.store.is_empty());
        assert_eq!(h.runner.stats().skipped_cycles, 1);
    }

    #[tokio::test]
    async fn test_create_confirm_and_place_order() {
        let executor = Arc::new(SimulatedExecutor::new());
        let mut h = harness(Arc::new(ReplayCandleFeed::new(breakout_candles())), executor.clone());

        // Inside bar has closed, breakout candle still open
        let report = h.runner.run_cycle(t0() + Duration::minutes(10)).await.unwrap();
        assert_eq!(report.topics, vec!["signal.created"]);
        assert!(h.store.get(paths::SIGNAL_ACTIVE).unwrap().value.as_json().is_some());

        // Breakout candle closed 30s ago
        let report = h.runner.run_cycle(t0() + Duration::seconds(15 * 60 + 30)).await.unwrap();
        assert_eq!(report.topics, vec!["signal.confirmed", "order.placed"]);
        assert!(h.runner.active_signal().is_none());
        assert!(h.store.get(paths::SIGNAL_ACTIVE).unwrap().value.is_null());
        assert_eq!(h.store.get(paths::ORDERS_COUNT).unwrap().value, StateValue::Int(1));

        let placed = executor.placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].strike, 101.0);

        // State change is visible before the domain event
        let topics = h.topics.lock().clone();
        let active_cleared = topics.iter().rposition(|t| t == "state.signal.active").unwrap();
        let confirmed = topics.iter().position(|t| t == "signal.confirmed").unwrap();
        assert!(active_cleared < confirmed);
    }

    #[tokio::test]
    async fn test_late_breakout_is_missed_without_order() {
        let executor = Arc::new(SimulatedExecutor::new());
        let mut h = harness(Arc::new(ReplayCandleFeed::new(breakout_candles())), executor.clone());

        h.runner.run_cycle(t0() + Duration::minutes(10)).await.unwrap();
        let report = h.runner.run_cycle(t0() + Duration::minutes(25)).await.unwrap();

        assert_eq!(report.topics, vec!["signal.missed"]);
        assert!(executor.placed().is_empty());
        assert!(h.runner.active_signal().is_none());
        assert_eq!(h.runner.stats().signals_missed, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_abandons_cycle() {
        let mut h = harness(Arc::new(FailingFeed), Arc::new(SimulatedExecutor::new()));

        let report = h.runner.run_cycle(t0() + Duration::minutes(10)).await.unwrap();

        assert!(report.fetch_failed);
        assert_eq!(report.topics, vec!["errors.data_fetch"]);
        assert!(h.store.get(paths::RUNNER_LAST_CYCLE_AT).is_none());
        assert!(h.store.get(paths::RUNNER_LAST_ERROR).is_some());
        assert_eq!(h.runner.stats().fetch_failures, 1);
    }

    #[tokio::test]
    async fn test_execution_failure_still_discards_signal() {
        let mut h = harness(
            Arc::new(ReplayCandleFeed::new(breakout_candles())),
            Arc::new(RejectingExecutor),
        );

        h.runner.run_cycle(t0() + Duration::minutes(10)).await.unwrap();
        let report = h.runner.run_cycle(t0() + Duration::seconds(15 * 60 + 30)).await.unwrap();

        assert_eq!(
            report.topics,
            vec!["signal.confirmed", "order.failed", "errors.order_execution"]
        );
        assert!(h.runner.active_signal().is_none());
        assert!(h.store.get(paths::ORDERS_COUNT).is_none());
        assert_eq!(h.runner.stats().orders_failed, 1);

        // Next cycle must not re-confirm the discarded range
        let report = h.runner.run_cycle(t0() + Duration::minutes(17)).await.unwrap();
        assert!(report.topics.is_empty());
    }

    #[tokio::test]
    async fn test_run_resumes_signal_and_stops() {
        let mut h = harness(
            Arc::new(ReplayCandleFeed::new(Vec::new())),
            Arc::new(SimulatedExecutor::new()),
        );
        let signal = Signal::new(100.0, 90.0, t0(), t0());
        h.store
            .update(paths::SIGNAL_ACTIVE, serde_json::to_value(&signal).unwrap())
            .unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();
        let stats = h.runner.run(stop_rx).await.unwrap();

        assert_eq!(stats.cycles, 0);
        assert_eq!(h.runner.active_signal().map(|s| s.id), Some(signal.id));
        assert_eq!(
            h.store.get(paths::RUNNER_STATUS).unwrap().value,
            StateValue::from("stopped")
        );
    }
}
