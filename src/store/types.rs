//! Type definitions for positions, liquidation records, and alerts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a leveraged position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

/// Lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Liquidated,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Liquidated => "liquidated",
            PositionStatus::Closed => "closed",
        }
    }
}

/// A leveraged margin position.
///
/// The liquidation price is fixed when the position is opened and never
/// recomputed by the monitor. `current_price` and `unrealized_pnl` are
/// refreshed on every monitoring pass while the position is open;
/// `realized_pnl` and `closed_at` are written exactly once, at the
/// transition to liquidated/closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub user_id: String,
    /// Trading pair, e.g. "ETH/USDT"
    pub pair: String,
    pub side: PositionSide,
    pub leverage: u8,
    pub entry_price: Decimal,
    /// Position size in base-asset units
    pub size: Decimal,
    /// Margin posted, in quote-currency units
    pub collateral: Decimal,
    /// Fixed at position open, quote-currency units
    pub liquidation_price: Decimal,
    /// Last observed mark price
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Set only on close/liquidation
    pub realized_pnl: Option<Decimal>,
}

impl Position {
    /// Base asset of the trading pair (e.g. "ETH" for "ETH/USDT").
    pub fn base_asset(&self) -> &str {
        self.pair.split('/').next().unwrap_or(&self.pair)
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// Partial update applied to a position. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct PositionUpdate {
    pub current_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub status: Option<PositionStatus>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: Option<Decimal>,
}

impl PositionUpdate {
    /// Update that refreshes the live mark fields only.
    pub fn mark(current_price: Decimal, unrealized_pnl: Decimal) -> Self {
        Self {
            current_price: Some(current_price),
            unrealized_pnl: Some(unrealized_pnl),
            ..Default::default()
        }
    }

    /// Update that closes a position as liquidated.
    pub fn liquidated(closed_at: DateTime<Utc>, realized_pnl: Decimal) -> Self {
        Self {
            status: Some(PositionStatus::Liquidated),
            closed_at: Some(closed_at),
            realized_pnl: Some(realized_pnl),
            ..Default::default()
        }
    }
}

/// How a position was force-closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiquidationType {
    /// Closed by the monitor because the user opted into auto-deleverage
    Auto,
    /// Closed through an operator/manual flow
    Manual,
}

impl LiquidationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiquidationType::Auto => "auto",
            LiquidationType::Manual => "manual",
        }
    }
}

/// Immutable audit entry created exactly once per liquidation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationRecord {
    pub position_id: i64,
    pub user_id: String,
    pub pair: String,
    pub side: PositionSide,
    pub leverage: u8,
    pub entry_price: Decimal,
    pub liquidation_price: Decimal,
    pub size: Decimal,
    pub loss_amount: Decimal,
    pub remaining_collateral: Decimal,
    pub liquidation_type: LiquidationType,
    pub created_at: DateTime<Utc>,
}

/// Per-user opt-in flags, read-only from the monitor's perspective.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UserLeverageSettings {
    pub auto_deleverage_enabled: bool,
    pub liquidation_warning_enabled: bool,
}

impl Default for UserLeverageSettings {
    fn default() -> Self {
        Self {
            auto_deleverage_enabled: false,
            liquidation_warning_enabled: true,
        }
    }
}

/// Category of a security alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    LiquidationWarning,
    LiquidationImminent,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::LiquidationWarning => "liquidation_warning",
            AlertType::LiquidationImminent => "liquidation_imminent",
        }
    }
}

/// Alert severity for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// Immutable notification record, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub user_id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub description: String,
    /// Structured context (position id, prices, distance, ...)
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SecurityAlert {
    pub fn new(
        user_id: impl Into<String>,
        alert_type: AlertType,
        severity: AlertSeverity,
        description: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            alert_type,
            severity,
            description: description.into(),
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Current USD quote for a base asset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceQuote {
    pub usd: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl PriceQuote {
    pub fn new(usd: Decimal) -> Self {
        Self {
            usd,
            updated_at: Utc::now(),
        }
    }
}
