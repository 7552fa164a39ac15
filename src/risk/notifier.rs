//! Warning alerts for positions in the warning band.
//!
//! Repeated warnings for the same position are deduplicated: at most one
//! alert per position per cooldown window. The window re-arms when it
//! elapses or when the position leaves the warning band.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::store::{AlertSeverity, AlertType, PositionStore, SecurityAlert};

use super::classifier::RiskAssessment;

/// What the notifier did with a warning-level position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningOutcome {
    AlertRaised,
    /// A warning for this position was already raised within the window
    Suppressed,
    /// User has liquidation warnings disabled
    OptedOut,
}

/// Raises `liquidation_warning` alerts, gated by the user's opt-in flag.
/// Never mutates positions.
pub struct WarningNotifier {
    store: Arc<dyn PositionStore>,
    cooldown: Duration,
    last_warned: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl WarningNotifier {
    pub fn new(store: Arc<dyn PositionStore>, cooldown_secs: u64) -> Self {
        Self {
            store,
            cooldown: Duration::seconds(cooldown_secs as i64),
            last_warned: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a position classified warning this pass.
    pub async fn handle_warning(
        &self,
        assessment: &RiskAssessment,
    ) -> anyhow::Result<WarningOutcome> {
        let settings = self
            .store
            .leverage_settings(&assessment.user_id)
            .await?
            .unwrap_or_default();

        if !settings.liquidation_warning_enabled {
            return Ok(WarningOutcome::OptedOut);
        }

        let now = Utc::now();
        {
            let mut last_warned = self.last_warned.lock().await;
            // Expired entries no longer suppress anything; dropping them
            // here keeps the map from accumulating positions that were
            // closed externally while still in the warning band.
            last_warned.retain(|_, warned_at| now - *warned_at < self.cooldown);
            if last_warned.contains_key(&assessment.position_id) {
                debug!(
                    position_id = assessment.position_id,
                    "Warning suppressed, still within cooldown window"
                );
                return Ok(WarningOutcome::Suppressed);
            }
        }

        let alert = SecurityAlert::new(
            assessment.user_id.clone(),
            AlertType::LiquidationWarning,
            AlertSeverity::Warning,
            format!(
                "{} position is approaching its liquidation price ({:.2}% away)",
                assessment.pair, assessment.distance_to_liquidation
            ),
            serde_json::json!({
                "position_id": assessment.position_id,
                "pair": assessment.pair,
                "current_price": assessment.current_price,
                "liquidation_price": assessment.liquidation_price,
                "distance_to_liquidation_pct": assessment.distance_to_liquidation,
            }),
        );
        self.store.create_security_alert(&alert).await?;
        self.last_warned
            .lock()
            .await
            .insert(assessment.position_id, now);

        warn!(
            position_id = assessment.position_id,
            user = %assessment.user_id,
            pair = %assessment.pair,
            current_price = %assessment.current_price,
            liquidation_price = %assessment.liquidation_price,
            distance_pct = %assessment.distance_to_liquidation,
            "Liquidation warning raised"
        );

        Ok(WarningOutcome::AlertRaised)
    }

    /// Re-arm the cooldown for a position that left the warning band or
    /// was closed.
    pub async fn reset(&self, position_id: i64) {
        self.last_warned.lock().await.remove(&position_id);
    }
}
