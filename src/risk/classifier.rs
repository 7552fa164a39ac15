//! Pure risk classification for leveraged positions.
//!
//! Maps a position plus a current mark price to a [`RiskAssessment`].
//! No I/O and no side effects; persistence of the refreshed mark fields
//! is the monitor's job.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::store::{Position, PositionSide};

/// Proximity of a position to forced liquidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Warning,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Warning => "warning",
            RiskLevel::Critical => "critical",
        }
    }
}

/// Which long-side warning inequality to apply.
///
/// `Symmetric` mirrors the short side: a long warns once price falls to
/// within the band above its liquidation price. `Legacy` compares
/// against 115% of the liquidation price from the opposite direction,
/// flagging a long only while price sits far above its liquidation
/// line, for deployments that depend on that behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningBand {
    Symmetric,
    Legacy,
}

impl Default for WarningBand {
    fn default() -> Self {
        WarningBand::Symmetric
    }
}

/// Classification thresholds.
///
/// Both thresholds are multipliers on the liquidation price. A long is
/// critical at or below `liquidation_threshold` times its liquidation
/// price; a short is critical at or above it.
#[derive(Debug, Clone, Copy)]
pub struct RiskThresholds {
    pub liquidation_threshold: Decimal,
    pub warning_threshold: Decimal,
    pub warning_band: WarningBand,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            liquidation_threshold: dec!(0.95),
            warning_threshold: dec!(0.85),
            warning_band: WarningBand::Symmetric,
        }
    }
}

/// Derived, non-persisted risk snapshot for one (position, price) pair.
///
/// Recomputed on every pass; only the mark fields it carries are folded
/// back into the position record.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub position_id: i64,
    pub user_id: String,
    pub pair: String,
    pub current_price: Decimal,
    pub liquidation_price: Decimal,
    pub risk_level: RiskLevel,
    /// Signed percentage; positive on the safe side of the liquidation
    /// line, negative past it.
    pub distance_to_liquidation: Decimal,
}

/// Signed distance from the liquidation line, as a percentage.
pub fn distance_to_liquidation(
    side: PositionSide,
    current_price: Decimal,
    liquidation_price: Decimal,
) -> Decimal {
    if liquidation_price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let raw = match side {
        PositionSide::Long => (current_price - liquidation_price) / liquidation_price,
        PositionSide::Short => (liquidation_price - current_price) / liquidation_price,
    };
    raw * dec!(100)
}

/// Mark-to-market profit or loss for an open position.
pub fn unrealized_pnl(position: &Position, current_price: Decimal) -> Decimal {
    match position.side {
        PositionSide::Long => (current_price - position.entry_price) * position.size,
        PositionSide::Short => (position.entry_price - current_price) * position.size,
    }
}

/// Classify a position against a current mark price.
pub fn classify(
    position: &Position,
    current_price: Decimal,
    thresholds: &RiskThresholds,
) -> RiskAssessment {
    let liq = position.liquidation_price;
    let risk_level = if liq <= Decimal::ZERO {
        // No meaningful liquidation line; nothing to measure against.
        RiskLevel::Safe
    } else {
        level_for(position.side, current_price, liq, thresholds)
    };

    RiskAssessment {
        position_id: position.id,
        user_id: position.user_id.clone(),
        pair: position.pair.clone(),
        current_price,
        liquidation_price: liq,
        risk_level,
        distance_to_liquidation: distance_to_liquidation(position.side, current_price, liq),
    }
}

fn level_for(
    side: PositionSide,
    price: Decimal,
    liq: Decimal,
    thresholds: &RiskThresholds,
) -> RiskLevel {
    let critical_line = liq * thresholds.liquidation_threshold;
    // Long warning line sits above the liquidation price by the same
    // margin the short line sits below it: liq * (1 + (1 - warn)).
    let long_warning_line = liq * (Decimal::ONE + (Decimal::ONE - thresholds.warning_threshold));

    match side {
        PositionSide::Long => {
            if price <= critical_line {
                RiskLevel::Critical
            } else {
                let in_warning = match thresholds.warning_band {
                    WarningBand::Symmetric => price <= long_warning_line,
                    WarningBand::Legacy => price >= long_warning_line,
                };
                if in_warning {
                    RiskLevel::Warning
                } else {
                    RiskLevel::Safe
                }
            }
        }
        PositionSide::Short => {
            if price >= critical_line {
                RiskLevel::Critical
            } else if price >= liq * thresholds.warning_threshold {
                RiskLevel::Warning
            } else {
                RiskLevel::Safe
            }
        }
    }
}
