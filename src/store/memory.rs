//! In-memory store and price feed for tests and paper runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::debug;

use super::traits::{PositionStore, PriceFeed};
use super::types::{
    LiquidationRecord, Position, PositionStatus, PositionUpdate, PriceQuote, SecurityAlert,
    UserLeverageSettings,
};

/// In-memory [`PositionStore`] backed by maps under an async lock.
#[derive(Default)]
pub struct MemoryStore {
    positions: Arc<RwLock<HashMap<i64, Position>>>,
    settings: Arc<RwLock<HashMap<String, UserLeverageSettings>>>,
    liquidations: Arc<RwLock<Vec<LiquidationRecord>>>,
    alerts: Arc<RwLock<Vec<SecurityAlert>>>,
    next_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    /// Insert a position, assigning an id if the given one is zero.
    pub async fn insert_position(&self, mut position: Position) -> i64 {
        if position.id == 0 {
            position.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        }
        let id = position.id;
        self.positions.write().await.insert(id, position);
        id
    }

    pub async fn set_settings(&self, user_id: &str, settings: UserLeverageSettings) {
        self.settings
            .write()
            .await
            .insert(user_id.to_string(), settings);
    }

    /// Snapshot of recorded liquidations (test/inspection helper).
    pub async fn liquidation_records(&self) -> Vec<LiquidationRecord> {
        self.liquidations.read().await.clone()
    }

    /// Snapshot of recorded alerts (test/inspection helper).
    pub async fn security_alerts(&self) -> Vec<SecurityAlert> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn user_positions(
        &self,
        user_id: &str,
        status: PositionStatus,
    ) -> anyhow::Result<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id && p.status == status)
            .cloned()
            .collect())
    }

    async fn positions_by_pair(
        &self,
        pair: &str,
        status: PositionStatus,
    ) -> anyhow::Result<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.pair == pair && p.status == status)
            .cloned()
            .collect())
    }

    async fn position(&self, id: i64) -> anyhow::Result<Option<Position>> {
        Ok(self.positions.read().await.get(&id).cloned())
    }

    async fn update_position(&self, id: i64, update: PositionUpdate) -> anyhow::Result<()> {
        let mut positions = self.positions.write().await;
        let Some(position) = positions.get_mut(&id) else {
            anyhow::bail!("position {} not found", id);
        };

        if let Some(price) = update.current_price {
            position.current_price = price;
        }
        if let Some(pnl) = update.unrealized_pnl {
            position.unrealized_pnl = pnl;
        }
        if let Some(status) = update.status {
            position.status = status;
        }
        if let Some(closed_at) = update.closed_at {
            position.closed_at = Some(closed_at);
        }
        if let Some(realized) = update.realized_pnl {
            position.realized_pnl = Some(realized);
        }

        Ok(())
    }

    async fn create_liquidation_record(&self, record: &LiquidationRecord) -> anyhow::Result<()> {
        self.liquidations.write().await.push(record.clone());
        Ok(())
    }

    async fn leverage_settings(
        &self,
        user_id: &str,
    ) -> anyhow::Result<Option<UserLeverageSettings>> {
        Ok(self.settings.read().await.get(user_id).copied())
    }

    async fn create_security_alert(&self, alert: &SecurityAlert) -> anyhow::Result<()> {
        debug!(
            user = %alert.user_id,
            alert_type = alert.alert_type.as_str(),
            severity = alert.severity.as_str(),
            "Security alert recorded"
        );
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }
}

/// Cache-backed [`PriceFeed`]: quotes are pushed in via [`set_price`]
/// (by a market-data task or a test) and served from memory.
///
/// [`set_price`]: CachedPriceFeed::set_price
#[derive(Default)]
pub struct CachedPriceFeed {
    quotes: Arc<RwLock<HashMap<String, PriceQuote>>>,
}

impl CachedPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_price(&self, base_asset: &str, usd: Decimal) {
        self.quotes
            .write()
            .await
            .insert(base_asset.to_string(), PriceQuote::new(usd));
    }

    pub async fn clear_price(&self, base_asset: &str) {
        self.quotes.write().await.remove(base_asset);
    }
}

#[async_trait]
impl PriceFeed for CachedPriceFeed {
    async fn price(&self, base_asset: &str) -> anyhow::Result<Option<PriceQuote>> {
        Ok(self.quotes.read().await.get(base_asset).copied())
    }
}
