//! Position storage and price-feed boundaries.
//!
//! The monitor core only talks to the [`PositionStore`] and [`PriceFeed`]
//! traits; the in-memory and SQLite implementations here are the two
//! stores shipped with the crate.

mod memory;
mod sqlite;
mod traits;
mod types;

pub use memory::{CachedPriceFeed, MemoryStore};
pub use sqlite::SqliteStore;
pub use traits::{PositionStore, PriceFeed};
#[cfg(test)]
pub use traits::MockPriceFeed;
pub use types::{
    AlertSeverity, AlertType, LiquidationRecord, LiquidationType, Position, PositionSide,
    PositionStatus, PositionUpdate, PriceQuote, SecurityAlert, UserLeverageSettings,
};
