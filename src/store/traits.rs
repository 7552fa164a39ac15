//! Collaborator boundaries: position storage and the price oracle.
//!
//! The monitor core is storage-agnostic; anything that can answer these
//! queries can be monitored. Implementations in this crate: an in-memory
//! store for tests and paper runs, and a SQLite-backed store.

use async_trait::async_trait;

use super::types::{
    LiquidationRecord, Position, PositionStatus, PositionUpdate, PriceQuote, SecurityAlert,
    UserLeverageSettings,
};

/// CRUD boundary over position records, settings, and append-only
/// liquidation/alert records.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// All positions for a user with the given status.
    async fn user_positions(
        &self,
        user_id: &str,
        status: PositionStatus,
    ) -> anyhow::Result<Vec<Position>>;

    /// All positions on a trading pair with the given status.
    async fn positions_by_pair(
        &self,
        pair: &str,
        status: PositionStatus,
    ) -> anyhow::Result<Vec<Position>>;

    /// Single position lookup; `None` if it does not exist.
    async fn position(&self, id: i64) -> anyhow::Result<Option<Position>>;

    /// Apply a partial update to a position.
    async fn update_position(&self, id: i64, update: PositionUpdate) -> anyhow::Result<()>;

    /// Append an immutable liquidation audit record.
    async fn create_liquidation_record(&self, record: &LiquidationRecord) -> anyhow::Result<()>;

    /// Per-user opt-in flags; `None` if the user never configured them.
    async fn leverage_settings(
        &self,
        user_id: &str,
    ) -> anyhow::Result<Option<UserLeverageSettings>>;

    /// Append an immutable security alert.
    async fn create_security_alert(&self, alert: &SecurityAlert) -> anyhow::Result<()>;

    /// Append the liquidation record and close the position as one
    /// logical unit. Stores with transactions should override this.
    async fn liquidate(
        &self,
        record: &LiquidationRecord,
        update: PositionUpdate,
    ) -> anyhow::Result<()> {
        self.create_liquidation_record(record).await?;
        self.update_position(record.position_id, update).await
    }
}

/// Current-price lookup for a base asset.
///
/// A missing quote is a valid outcome (`Ok(None)`), not an error; the
/// feed's own caching and retry policy are behind this boundary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn price(&self, base_asset: &str) -> anyhow::Result<Option<PriceQuote>>;
}
