//! The monitoring loop: periodic evaluation of every open position.
//!
//! One engine instance per data store. There is no cross-process
//! coordination here; running two instances against the same store would
//! double-evaluate positions and risk double-liquidation, so production
//! deployments need external leader election in front of `start()`.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::MonitorError;
use crate::store::{Position, PositionStatus, PositionStore, PositionUpdate, PriceFeed};

use super::classifier::{classify, unrealized_pnl, RiskAssessment, RiskLevel, RiskThresholds};
use super::executor::{ExecutionOutcome, LiquidationExecutor};
use super::notifier::{WarningNotifier, WarningOutcome};

/// Counters from one monitoring pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Pass skipped because the previous one was still running
    pub skipped_overlap: bool,
    pub users: usize,
    pub evaluated: usize,
    pub skipped_no_price: usize,
    pub liquidated: usize,
    pub warnings_raised: usize,
}

/// Aggregate risk view for one user's open positions.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserRiskMetrics {
    pub total_positions: usize,
    pub critical_positions: usize,
    pub warning_positions: usize,
    pub safe_positions: usize,
    pub positions: Vec<RiskAssessment>,
}

/// Drives periodic risk evaluation over all open positions.
pub struct MonitorEngine {
    store: Arc<dyn PositionStore>,
    feed: Arc<dyn PriceFeed>,
    executor: LiquidationExecutor,
    notifier: WarningNotifier,
    thresholds: RiskThresholds,
    pairs: Vec<String>,
    interval: Duration,
    call_timeout: Duration,
    running: AtomicBool,
    generation: AtomicU64,
    tick_in_flight: AtomicBool,
}

impl MonitorEngine {
    pub fn new(store: Arc<dyn PositionStore>, feed: Arc<dyn PriceFeed>, config: &Config) -> Self {
        let thresholds = RiskThresholds {
            liquidation_threshold: config.risk.liquidation_threshold,
            warning_threshold: config.risk.warning_threshold,
            warning_band: config.risk.warning_band,
        };

        Self {
            executor: LiquidationExecutor::new(store.clone()),
            notifier: WarningNotifier::new(store.clone(), config.risk.warning_cooldown_secs),
            store,
            feed,
            thresholds,
            pairs: config.monitor.pairs.clone(),
            interval: Duration::from_secs(config.monitor.interval_secs),
            call_timeout: Duration::from_millis(config.monitor.call_timeout_ms),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            tick_in_flight: AtomicBool::new(false),
        }
    }

    /// Start the recurring monitoring loop. Idempotent: returns `None`
    /// if the engine is already running. The first pass runs
    /// immediately, subsequent passes at the configured interval.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Risk monitor already running");
            return None;
        }
        // Each start gets its own generation. A loop left over from a
        // previous start/stop cycle that wakes after a quick restart
        // sees a newer generation and exits instead of resuming.
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let engine = Arc::clone(self);
        Some(tokio::spawn(async move {
            info!(
                interval_secs = engine.interval.as_secs(),
                pairs = engine.pairs.len(),
                "Risk monitor started"
            );

            let mut ticker = tokio::time::interval(engine.interval);
            while engine.loop_is_current(generation) {
                ticker.tick().await;
                if !engine.loop_is_current(generation) {
                    break;
                }
                match engine.run_tick_once().await {
                    Ok(summary) if summary.skipped_overlap => {}
                    Ok(summary) => debug!(
                        users = summary.users,
                        evaluated = summary.evaluated,
                        skipped_no_price = summary.skipped_no_price,
                        liquidated = summary.liquidated,
                        warnings = summary.warnings_raised,
                        "Monitoring pass complete"
                    ),
                    // Enumeration failures abort this pass only; the
                    // next one fires on schedule.
                    Err(e) => error!("Monitoring pass failed: {e:#}"),
                }
            }
            info!("Risk monitor stopped");
        }))
    }

    /// Stop the loop. In-flight passes complete; future passes are
    /// suppressed. Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Risk monitor stopping");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn loop_is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Run a single monitoring pass. Public so operators and tests can
    /// drive passes deterministically without waiting on wall-clock
    /// time.
    pub async fn run_tick_once(&self) -> anyhow::Result<TickSummary> {
        if self
            .tick_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Previous monitoring pass still running, skipping this one");
            return Ok(TickSummary {
                skipped_overlap: true,
                ..Default::default()
            });
        }
        let result = self.run_tick_inner().await;
        self.tick_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn run_tick_inner(&self) -> anyhow::Result<TickSummary> {
        let mut summary = TickSummary::default();

        // Scan each monitored pair and union the owning user ids.
        let mut users: BTreeSet<String> = BTreeSet::new();
        for pair in &self.pairs {
            let positions = self
                .bounded(self.store.positions_by_pair(pair, PositionStatus::Open))
                .await
                .with_context(|| format!("enumerating open positions on {}", pair))?;
            users.extend(positions.into_iter().map(|p| p.user_id));
        }
        summary.users = users.len();

        for user_id in users {
            // One bad user must not halt monitoring of the rest.
            if let Err(e) = self.evaluate_user(&user_id, &mut summary).await {
                error!(user = %user_id, "Skipping user after error: {e:#}");
            }
        }

        Ok(summary)
    }

    async fn evaluate_user(&self, user_id: &str, summary: &mut TickSummary) -> anyhow::Result<()> {
        let positions = self
            .bounded(self.store.user_positions(user_id, PositionStatus::Open))
            .await
            .context("fetching user positions")?;

        for position in positions {
            match self.evaluate_position(&position, summary).await {
                Ok(()) => {}
                Err(e) => {
                    error!(
                        position_id = position.id,
                        user = %user_id,
                        "Skipping position after error: {e:#}"
                    );
                }
            }
        }
        Ok(())
    }

    async fn evaluate_position(
        &self,
        position: &Position,
        summary: &mut TickSummary,
    ) -> anyhow::Result<()> {
        let quote = self
            .bounded(self.feed.price(position.base_asset()))
            .await
            .context("price lookup")?;

        let Some(quote) = quote else {
            // Transient: nothing is mutated for this position this pass.
            debug!(
                position_id = position.id,
                asset = position.base_asset(),
                "No price available, skipping position this pass"
            );
            summary.skipped_no_price += 1;
            return Ok(());
        };

        let assessment = classify(position, quote.usd, &self.thresholds);

        // Refresh the live mark fields on every successful
        // classification, whatever the risk level.
        self.bounded(self.store.update_position(
            position.id,
            PositionUpdate::mark(quote.usd, unrealized_pnl(position, quote.usd)),
        ))
        .await
        .context("updating mark fields")?;
        summary.evaluated += 1;

        match assessment.risk_level {
            RiskLevel::Critical => {
                self.notifier.reset(position.id).await;
                if let ExecutionOutcome::Liquidated { .. } =
                    self.executor.handle_critical(&assessment).await?
                {
                    summary.liquidated += 1;
                }
            }
            RiskLevel::Warning => {
                if self.notifier.handle_warning(&assessment).await? == WarningOutcome::AlertRaised {
                    summary.warnings_raised += 1;
                }
            }
            RiskLevel::Safe => {
                self.notifier.reset(position.id).await;
            }
        }

        Ok(())
    }

    /// On-demand single-position classification. Read-only: no mark
    /// update, no alerts, no liquidation.
    pub async fn check_position(&self, id: i64) -> anyhow::Result<RiskAssessment> {
        let position = self
            .store
            .position(id)
            .await?
            .ok_or(MonitorError::PositionNotFound(id))?;

        let quote = self
            .feed
            .price(position.base_asset())
            .await?
            .ok_or_else(|| MonitorError::PriceUnavailable(position.base_asset().to_string()))?;

        Ok(classify(&position, quote.usd, &self.thresholds))
    }

    /// Aggregate risk view over all of a user's open positions.
    /// Read-only. Counts always cover every open position: when the
    /// feed has no quote the last observed mark is used, and a position
    /// that has never been marked is reported safe at zero distance.
    pub async fn user_risk_metrics(&self, user_id: &str) -> anyhow::Result<UserRiskMetrics> {
        let positions = self
            .store
            .user_positions(user_id, PositionStatus::Open)
            .await?;

        let mut metrics = UserRiskMetrics {
            total_positions: positions.len(),
            critical_positions: 0,
            warning_positions: 0,
            safe_positions: 0,
            positions: Vec::with_capacity(positions.len()),
        };

        for position in &positions {
            let mark = match self.feed.price(position.base_asset()).await? {
                Some(quote) => Some(quote.usd),
                None if position.current_price > Decimal::ZERO => {
                    debug!(
                        position_id = position.id,
                        "No live quote, using last observed mark for metrics"
                    );
                    Some(position.current_price)
                }
                None => None,
            };

            let assessment = match mark {
                Some(price) => classify(position, price, &self.thresholds),
                None => {
                    debug!(
                        position_id = position.id,
                        "Position has never been marked, reporting safe"
                    );
                    RiskAssessment {
                        position_id: position.id,
                        user_id: position.user_id.clone(),
                        pair: position.pair.clone(),
                        current_price: Decimal::ZERO,
                        liquidation_price: position.liquidation_price,
                        risk_level: RiskLevel::Safe,
                        distance_to_liquidation: Decimal::ZERO,
                    }
                }
            };

            match assessment.risk_level {
                RiskLevel::Critical => metrics.critical_positions += 1,
                RiskLevel::Warning => metrics.warning_positions += 1,
                RiskLevel::Safe => metrics.safe_positions += 1,
            }
            metrics.positions.push(assessment);
        }

        Ok(metrics)
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| anyhow!("call exceeded {}ms timeout", self.call_timeout.as_millis()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        CachedPriceFeed, LiquidationRecord, MemoryStore, MockPriceFeed, Position, PositionSide,
        SecurityAlert, UserLeverageSettings,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.monitor.pairs = vec!["ETH/USDT".to_string(), "BTC/USDT".to_string()];
        config
    }

    fn open_position(user: &str, pair: &str, side: PositionSide, liq: Decimal) -> Position {
        Position {
            id: 0,
            user_id: user.to_string(),
            pair: pair.to_string(),
            side,
            leverage: 10,
            entry_price: dec!(2000),
            size: dec!(1),
            collateral: dec!(200),
            liquidation_price: liq,
            current_price: dec!(2000),
            unrealized_pnl: Decimal::ZERO,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            realized_pnl: None,
        }
    }

    async fn engine_with(
        store: Arc<MemoryStore>,
        feed: Arc<dyn PriceFeed>,
    ) -> Arc<MonitorEngine> {
        Arc::new(MonitorEngine::new(
            store as Arc<dyn PositionStore>,
            feed,
            &test_config(),
        ))
    }

    #[tokio::test]
    async fn test_tick_refreshes_marks_every_pass() {
        let store = Arc::new(MemoryStore::new());
        let id = store
            .insert_position(open_position("alice", "ETH/USDT", PositionSide::Long, dec!(1800)))
            .await;

        let feed = Arc::new(CachedPriceFeed::new());
        feed.set_price("ETH", dec!(2100)).await;

        let engine = engine_with(store.clone(), feed.clone()).await;
        let summary = engine.run_tick_once().await.unwrap();
        assert_eq!(summary.users, 1);
        assert_eq!(summary.evaluated, 1);

        let pos = store.position(id).await.unwrap().unwrap();
        assert_eq!(pos.current_price, dec!(2100));
        assert_eq!(pos.unrealized_pnl, dec!(100));
        assert_eq!(pos.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_tick_liquidates_critical_when_opted_in() {
        let store = Arc::new(MemoryStore::new());
        let id = store
            .insert_position(open_position("alice", "ETH/USDT", PositionSide::Long, dec!(1800)))
            .await;
        store
            .set_settings(
                "alice",
                UserLeverageSettings {
                    auto_deleverage_enabled: true,
                    liquidation_warning_enabled: true,
                },
            )
            .await;

        let feed = Arc::new(CachedPriceFeed::new());
        feed.set_price("ETH", dec!(1700)).await; // below 1800 * 0.95

        let engine = engine_with(store.clone(), feed).await;
        let summary = engine.run_tick_once().await.unwrap();
        assert_eq!(summary.liquidated, 1);

        let pos = store.position(id).await.unwrap().unwrap();
        assert_eq!(pos.status, PositionStatus::Liquidated);
        assert_eq!(pos.realized_pnl, Some(dec!(-200)));

        // Idempotence: a second pass finds no open positions
        let summary = engine.run_tick_once().await.unwrap();
        assert_eq!(summary.users, 0);
        assert_eq!(store.liquidation_records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_tick_raises_warning_once_per_window() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_position(open_position("alice", "ETH/USDT", PositionSide::Short, dec!(2200)))
            .await;

        let feed = Arc::new(CachedPriceFeed::new());
        feed.set_price("ETH", dec!(2050)).await; // warning band for the short

        let engine = engine_with(store.clone(), feed).await;
        let first = engine.run_tick_once().await.unwrap();
        assert_eq!(first.warnings_raised, 1);

        let second = engine.run_tick_once().await.unwrap();
        assert_eq!(second.warnings_raised, 0);
        assert_eq!(store.security_alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_price_skips_position_without_mutation() {
        let store = Arc::new(MemoryStore::new());
        let eth_id = store
            .insert_position(open_position("alice", "ETH/USDT", PositionSide::Long, dec!(1800)))
            .await;
        let btc_id = store
            .insert_position(open_position("alice", "BTC/USDT", PositionSide::Long, dec!(1800)))
            .await;

        let feed = Arc::new(CachedPriceFeed::new());
        feed.set_price("BTC", dec!(2100)).await; // no ETH quote

        let engine = engine_with(store.clone(), feed).await;
        let summary = engine.run_tick_once().await.unwrap();
        assert_eq!(summary.skipped_no_price, 1);
        assert_eq!(summary.evaluated, 1);

        let eth = store.position(eth_id).await.unwrap().unwrap();
        assert_eq!(eth.current_price, dec!(2000)); // untouched
        let btc = store.position(btc_id).await.unwrap().unwrap();
        assert_eq!(btc.current_price, dec!(2100));
    }

    #[tokio::test]
    async fn test_single_flight_guard_skips_overlapping_pass() {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(CachedPriceFeed::new());
        let engine = engine_with(store, feed).await;

        engine.tick_in_flight.store(true, Ordering::SeqCst);
        let summary = engine.run_tick_once().await.unwrap();
        assert!(summary.skipped_overlap);

        engine.tick_in_flight.store(false, Ordering::SeqCst);
        let summary = engine.run_tick_once().await.unwrap();
        assert!(!summary.skipped_overlap);
    }

    /// Store whose per-user query fails for one user.
    struct FailingUserStore {
        inner: Arc<MemoryStore>,
        failing_user: String,
    }

    #[async_trait]
    impl PositionStore for FailingUserStore {
        async fn user_positions(
            &self,
            user_id: &str,
            status: PositionStatus,
        ) -> anyhow::Result<Vec<Position>> {
            if user_id == self.failing_user {
                anyhow::bail!("storage offline for {}", user_id);
            }
            self.inner.user_positions(user_id, status).await
        }

        async fn positions_by_pair(
            &self,
            pair: &str,
            status: PositionStatus,
        ) -> anyhow::Result<Vec<Position>> {
            self.inner.positions_by_pair(pair, status).await
        }

        async fn position(&self, id: i64) -> anyhow::Result<Option<Position>> {
            self.inner.position(id).await
        }

        async fn update_position(&self, id: i64, update: PositionUpdate) -> anyhow::Result<()> {
            self.inner.update_position(id, update).await
        }

        async fn create_liquidation_record(
            &self,
            record: &LiquidationRecord,
        ) -> anyhow::Result<()> {
            self.inner.create_liquidation_record(record).await
        }

        async fn leverage_settings(
            &self,
            user_id: &str,
        ) -> anyhow::Result<Option<UserLeverageSettings>> {
            self.inner.leverage_settings(user_id).await
        }

        async fn create_security_alert(&self, alert: &SecurityAlert) -> anyhow::Result<()> {
            self.inner.create_security_alert(alert).await
        }
    }

    #[tokio::test]
    async fn test_one_failing_user_does_not_stop_the_rest() {
        let inner = Arc::new(MemoryStore::new());
        inner
            .insert_position(open_position("alice", "ETH/USDT", PositionSide::Long, dec!(1800)))
            .await;
        let bob_id = inner
            .insert_position(open_position("bob", "ETH/USDT", PositionSide::Long, dec!(1800)))
            .await;

        let store = Arc::new(FailingUserStore {
            inner: inner.clone(),
            failing_user: "alice".to_string(),
        });
        let feed = Arc::new(CachedPriceFeed::new());
        feed.set_price("ETH", dec!(2100)).await;

        let engine = Arc::new(MonitorEngine::new(
            store as Arc<dyn PositionStore>,
            feed as Arc<dyn PriceFeed>,
            &test_config(),
        ));

        let summary = engine.run_tick_once().await.unwrap();
        // Bob was still evaluated despite Alice's store failing
        assert_eq!(summary.evaluated, 1);
        let bob = inner.position(bob_id).await.unwrap().unwrap();
        assert_eq!(bob.current_price, dec!(2100));
    }

    #[tokio::test]
    async fn test_feed_error_isolated_per_position() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_position(open_position("alice", "ETH/USDT", PositionSide::Long, dec!(1800)))
            .await;
        let btc_id = store
            .insert_position(open_position("alice", "BTC/USDT", PositionSide::Long, dec!(1800)))
            .await;

        let mut feed = MockPriceFeed::new();
        feed.expect_price()
            .withf(|asset| asset == "ETH")
            .returning(|_| Err(anyhow::anyhow!("oracle down")));
        feed.expect_price()
            .withf(|asset| asset == "BTC")
            .returning(|_| Ok(Some(crate::store::PriceQuote::new(dec!(2100)))));

        let engine = engine_with(store.clone(), Arc::new(feed)).await;
        let summary = engine.run_tick_once().await.unwrap();

        assert_eq!(summary.evaluated, 1);
        let btc = store.position(btc_id).await.unwrap().unwrap();
        assert_eq!(btc.current_price, dec!(2100));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_halts() {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(CachedPriceFeed::new());
        let engine = engine_with(store, feed).await;

        let handle = engine.start();
        assert!(handle.is_some());
        assert!(engine.is_running());

        // Second start is a no-op
        assert!(engine.start().is_none());

        engine.stop();
        assert!(!engine.is_running());
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_terminates_previous_loop() {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(CachedPriceFeed::new());
        let engine = engine_with(store, feed).await;

        let first = engine.start().expect("first start");
        // Let the first loop run its immediate pass and park on its timer
        tokio::time::sleep(Duration::from_millis(10)).await;

        engine.stop();
        let second = engine.start().expect("restart");

        // The old loop must exit at its next wake instead of ticking
        // alongside the new one at double frequency.
        tokio::time::timeout(Duration::from_secs(120), first)
            .await
            .expect("previous loop kept running after restart")
            .unwrap();

        engine.stop();
        second.abort();
    }

    #[tokio::test]
    async fn test_check_position_is_read_only() {
        let store = Arc::new(MemoryStore::new());
        let id = store
            .insert_position(open_position("alice", "ETH/USDT", PositionSide::Long, dec!(1800)))
            .await;
        let feed = Arc::new(CachedPriceFeed::new());
        feed.set_price("ETH", dec!(1700)).await; // critical

        let engine = engine_with(store.clone(), feed).await;
        let assessment = engine.check_position(id).await.unwrap();
        assert_eq!(assessment.risk_level, RiskLevel::Critical);

        // No side effects: still open, no records, no alerts, marks untouched
        let pos = store.position(id).await.unwrap().unwrap();
        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(pos.current_price, dec!(2000));
        assert!(store.liquidation_records().await.is_empty());
        assert!(store.security_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_check_position_not_found() {
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(CachedPriceFeed::new());
        let engine = engine_with(store, feed).await;

        let err = engine.check_position(42).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MonitorError>(),
            Some(MonitorError::PositionNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_check_position_price_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let id = store
            .insert_position(open_position("alice", "ETH/USDT", PositionSide::Long, dec!(1800)))
            .await;
        let feed = Arc::new(CachedPriceFeed::new());

        let engine = engine_with(store, feed).await;
        let err = engine.check_position(id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MonitorError>(),
            Some(MonitorError::PriceUnavailable(asset)) if asset == "ETH"
        ));
    }

    #[tokio::test]
    async fn test_user_risk_metrics_counts_sum_to_total() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_position(open_position("alice", "ETH/USDT", PositionSide::Long, dec!(1800)))
            .await;
        store
            .insert_position(open_position("alice", "BTC/USDT", PositionSide::Short, dec!(2200)))
            .await;
        // Third position with no live quote falls back to its last mark
        let mut stale = open_position("alice", "SOL/USDT", PositionSide::Long, dec!(1800));
        stale.current_price = dec!(1700); // critical at last mark
        store.insert_position(stale).await;

        let feed = Arc::new(CachedPriceFeed::new());
        feed.set_price("ETH", dec!(2500)).await; // safe
        feed.set_price("BTC", dec!(2050)).await; // short warning

        let engine = engine_with(store, feed).await;
        let metrics = engine.user_risk_metrics("alice").await.unwrap();

        assert_eq!(metrics.total_positions, 3);
        assert_eq!(metrics.safe_positions, 1);
        assert_eq!(metrics.warning_positions, 1);
        assert_eq!(metrics.critical_positions, 1);
        assert_eq!(
            metrics.safe_positions + metrics.warning_positions + metrics.critical_positions,
            metrics.total_positions
        );
        assert_eq!(metrics.positions.len(), 3);
    }
}
