//! Forced closure of positions at critical risk.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::store::{
    AlertSeverity, AlertType, LiquidationRecord, LiquidationType, Position, PositionSide,
    PositionStore, PositionUpdate, SecurityAlert, UserLeverageSettings,
};

use super::classifier::RiskAssessment;

/// What the executor did with a critical position.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Position force-closed, loss realized
    Liquidated {
        loss_amount: Decimal,
        remaining_collateral: Decimal,
    },
    /// Auto-deleverage disabled; critical alert raised, position left open
    AlertRaised,
    /// Position no longer open when re-checked; nothing done
    AlreadyClosed,
}

/// Executes auto-liquidations, or raises a manual-action-required alert
/// when the user has not opted into auto-deleverage.
pub struct LiquidationExecutor {
    store: Arc<dyn PositionStore>,
}

impl LiquidationExecutor {
    pub fn new(store: Arc<dyn PositionStore>) -> Self {
        Self { store }
    }

    /// Collateral consumed when the position is closed at its
    /// liquidation price.
    pub fn loss_amount(position: &Position) -> Decimal {
        match position.side {
            PositionSide::Long => {
                (position.entry_price - position.liquidation_price) * position.size
            }
            PositionSide::Short => {
                (position.liquidation_price - position.entry_price) * position.size
            }
        }
    }

    /// Handle a position classified critical this pass.
    ///
    /// The position is re-fetched immediately before acting so a
    /// position already closed by a concurrent path is never
    /// double-liquidated.
    pub async fn handle_critical(
        &self,
        assessment: &RiskAssessment,
    ) -> anyhow::Result<ExecutionOutcome> {
        let Some(position) = self.store.position(assessment.position_id).await? else {
            warn!(
                position_id = assessment.position_id,
                "Critical position vanished before execution"
            );
            return Ok(ExecutionOutcome::AlreadyClosed);
        };

        if !position.is_open() {
            info!(
                position_id = position.id,
                status = position.status.as_str(),
                "Position already closed, skipping liquidation"
            );
            return Ok(ExecutionOutcome::AlreadyClosed);
        }

        let settings = self
            .store
            .leverage_settings(&position.user_id)
            .await?
            .unwrap_or_default();

        if settings.auto_deleverage_enabled {
            self.liquidate(&position).await
        } else {
            self.raise_imminent_alert(&position, assessment, &settings)
                .await?;
            Ok(ExecutionOutcome::AlertRaised)
        }
    }

    async fn liquidate(&self, position: &Position) -> anyhow::Result<ExecutionOutcome> {
        let loss_amount = Self::loss_amount(position);
        let remaining_collateral = (position.collateral - loss_amount).max(Decimal::ZERO);
        let now = Utc::now();

        let record = LiquidationRecord {
            position_id: position.id,
            user_id: position.user_id.clone(),
            pair: position.pair.clone(),
            side: position.side,
            leverage: position.leverage,
            entry_price: position.entry_price,
            liquidation_price: position.liquidation_price,
            size: position.size,
            loss_amount,
            remaining_collateral,
            liquidation_type: LiquidationType::Auto,
            created_at: now,
        };

        self.store
            .liquidate(&record, PositionUpdate::liquidated(now, -loss_amount))
            .await?;

        error!(
            position_id = position.id,
            user = %position.user_id,
            pair = %position.pair,
            side = position.side.as_str(),
            loss = %loss_amount,
            remaining_collateral = %remaining_collateral,
            "Position auto-liquidated"
        );

        Ok(ExecutionOutcome::Liquidated {
            loss_amount,
            remaining_collateral,
        })
    }

    async fn raise_imminent_alert(
        &self,
        position: &Position,
        assessment: &RiskAssessment,
        settings: &UserLeverageSettings,
    ) -> anyhow::Result<()> {
        let alert = SecurityAlert::new(
            position.user_id.clone(),
            AlertType::LiquidationImminent,
            AlertSeverity::Critical,
            format!(
                "{} {} position is at critical risk of liquidation; manual action required",
                position.pair,
                position.side.as_str()
            ),
            serde_json::json!({
                "position_id": position.id,
                "pair": position.pair,
                "side": position.side.as_str(),
                "current_price": assessment.current_price,
                "liquidation_price": position.liquidation_price,
                "distance_to_liquidation_pct": assessment.distance_to_liquidation,
                "auto_deleverage_enabled": settings.auto_deleverage_enabled,
            }),
        );
        self.store.create_security_alert(&alert).await?;

        error!(
            position_id = position.id,
            user = %position.user_id,
            pair = %position.pair,
            current_price = %assessment.current_price,
            liquidation_price = %position.liquidation_price,
            "Liquidation imminent, auto-deleverage disabled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::classifier::{classify, RiskThresholds};
    use crate::store::{MemoryStore, PositionStatus};
    use rust_decimal_macros::dec;

    fn critical_long() -> Position {
        Position {
            id: 0,
            user_id: "alice".to_string(),
            pair: "ETH/USDT".to_string(),
            side: PositionSide::Long,
            leverage: 10,
            entry_price: dec!(2000),
            size: dec!(1),
            collateral: dec!(200),
            liquidation_price: dec!(1800),
            current_price: dec!(1750),
            unrealized_pnl: dec!(-250),
            status: PositionStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            realized_pnl: None,
        }
    }

    async fn setup(auto_deleverage: bool) -> (Arc<MemoryStore>, LiquidationExecutor, i64) {
        let store = Arc::new(MemoryStore::new());
        let id = store.insert_position(critical_long()).await;
        store
            .set_settings(
                "alice",
                UserLeverageSettings {
                    auto_deleverage_enabled: auto_deleverage,
                    liquidation_warning_enabled: true,
                },
            )
            .await;
        let executor = LiquidationExecutor::new(store.clone() as Arc<dyn PositionStore>);
        (store, executor, id)
    }

    fn assessment_for(store_id: i64, position: &Position) -> RiskAssessment {
        let mut pos = position.clone();
        pos.id = store_id;
        classify(&pos, dec!(1750), &RiskThresholds::default())
    }

    #[tokio::test]
    async fn test_auto_liquidation_arithmetic() {
        let (store, executor, id) = setup(true).await;
        let outcome = executor
            .handle_critical(&assessment_for(id, &critical_long()))
            .await
            .unwrap();

        // Long: loss = (2000 - 1800) * 1 = 200, remaining = max(0, 200 - 200) = 0
        assert_eq!(
            outcome,
            ExecutionOutcome::Liquidated {
                loss_amount: dec!(200),
                remaining_collateral: Decimal::ZERO,
            }
        );

        let pos = store.position(id).await.unwrap().unwrap();
        assert_eq!(pos.status, PositionStatus::Liquidated);
        assert_eq!(pos.realized_pnl, Some(dec!(-200)));
        assert!(pos.closed_at.is_some());

        let records = store.liquidation_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].liquidation_type, LiquidationType::Auto);
        assert_eq!(records[0].loss_amount, dec!(200));
    }

    #[tokio::test]
    async fn test_short_side_loss_amount() {
        let mut pos = critical_long();
        pos.side = PositionSide::Short;
        pos.liquidation_price = dec!(2200);
        // Short: loss = (2200 - 2000) * 1 = 200
        assert_eq!(LiquidationExecutor::loss_amount(&pos), dec!(200));
    }

    #[tokio::test]
    async fn test_disabled_auto_deleverage_raises_alert_only() {
        let (store, executor, id) = setup(false).await;
        let outcome = executor
            .handle_critical(&assessment_for(id, &critical_long()))
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::AlertRaised);

        // Position stays open, no liquidation record
        let pos = store.position(id).await.unwrap().unwrap();
        assert_eq!(pos.status, PositionStatus::Open);
        assert!(store.liquidation_records().await.is_empty());

        let alerts = store.security_alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::LiquidationImminent);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_already_liquidated_position_is_not_acted_on() {
        let (store, executor, id) = setup(true).await;
        store
            .update_position(
                id,
                PositionUpdate::liquidated(Utc::now(), dec!(-200)),
            )
            .await
            .unwrap();

        let outcome = executor
            .handle_critical(&assessment_for(id, &critical_long()))
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::AlreadyClosed);
        // No second record appended
        assert!(store.liquidation_records().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_settings_defaults_to_alert() {
        let store = Arc::new(MemoryStore::new());
        let id = store.insert_position(critical_long()).await;
        let executor = LiquidationExecutor::new(store.clone() as Arc<dyn PositionStore>);

        let outcome = executor
            .handle_critical(&assessment_for(id, &critical_long()))
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::AlertRaised);
        assert!(store.liquidation_records().await.is_empty());
    }
}
