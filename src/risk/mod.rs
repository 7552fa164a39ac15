//! Risk evaluation and the monitoring loop.
//!
//! - Classification of positions against their liquidation price
//! - Automatic liquidation of critical positions (user-gated)
//! - Warning alerts with per-position cooldown
//! - The periodic monitor and its query API

mod classifier;
mod executor;
mod monitor;
mod notifier;

pub use classifier::{
    classify, distance_to_liquidation, unrealized_pnl, RiskAssessment, RiskLevel, RiskThresholds,
    WarningBand,
};
pub use executor::{ExecutionOutcome, LiquidationExecutor};
pub use monitor::{MonitorEngine, TickSummary, UserRiskMetrics};
pub use notifier::{WarningNotifier, WarningOutcome};
