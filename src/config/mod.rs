//! Configuration for the risk monitor.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::risk::WarningBand;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Monitoring loop settings
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Risk classification parameters
    #[serde(default)]
    pub risk: RiskConfig,
    /// Storage settings
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between monitoring passes
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Timeout for each store/price-feed call inside a pass
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Trading pairs scanned when enumerating users with open positions
    #[serde(default = "default_pairs")]
    pub pairs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Critical at this multiple of the liquidation price (0.0-1.0)
    #[serde(default = "default_liquidation_threshold")]
    pub liquidation_threshold: Decimal,
    /// Warning band edge as a multiple of the liquidation price (0.0-1.0)
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: Decimal,
    /// Long-side warning inequality: "symmetric" (intended) or "legacy"
    #[serde(default)]
    pub warning_band: WarningBand,
    /// Minimum seconds between repeated warnings for the same position
    #[serde(default = "default_warning_cooldown_secs")]
    pub warning_cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite position database
    #[serde(default = "default_db_path")]
    pub path: String,
}

// Default value functions
fn default_interval_secs() -> u64 {
    30
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

fn default_pairs() -> Vec<String> {
    vec![
        "BTC/USDT".to_string(),
        "ETH/USDT".to_string(),
        "SOL/USDT".to_string(),
    ]
}

fn default_liquidation_threshold() -> Decimal {
    Decimal::new(95, 2) // 0.95
}

fn default_warning_threshold() -> Decimal {
    Decimal::new(85, 2) // 0.85
}

fn default_warning_cooldown_secs() -> u64 {
    900 // one warning per position per 15 minutes
}

fn default_db_path() -> String {
    "data/sentinel.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("SENTINEL"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.monitor.interval_secs > 0, "interval_secs must be > 0");
        anyhow::ensure!(
            self.monitor.call_timeout_ms > 0,
            "call_timeout_ms must be > 0"
        );

        anyhow::ensure!(
            self.risk.liquidation_threshold > Decimal::ZERO
                && self.risk.liquidation_threshold <= Decimal::ONE,
            "liquidation_threshold must be between 0 and 1"
        );
        anyhow::ensure!(
            self.risk.warning_threshold > Decimal::ZERO
                && self.risk.warning_threshold < self.risk.liquidation_threshold,
            "warning_threshold must be between 0 and liquidation_threshold"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            risk: RiskConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            call_timeout_ms: default_call_timeout_ms(),
            pairs: default_pairs(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            liquidation_threshold: default_liquidation_threshold(),
            warning_threshold: default_warning_threshold(),
            warning_band: WarningBand::default(),
            warning_cooldown_secs: default_warning_cooldown_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.monitor.interval_secs, 30);
        assert_eq!(config.risk.liquidation_threshold, dec!(0.95));
    }

    #[test]
    fn test_warning_threshold_must_stay_below_liquidation() {
        let mut config = Config::default();
        config.risk.warning_threshold = dec!(0.99);
        assert!(config.validate().is_err());
    }
}
