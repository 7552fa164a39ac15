//! SQLite-backed position store.
//!
//! Decimals are stored as TEXT to avoid float rounding; timestamps are
//! RFC 3339. Liquidation records and security alerts are append-only
//! tables with no update path.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::traits::PositionStore;
use super::types::{
    LiquidationRecord, LiquidationType, Position, PositionSide, PositionStatus, PositionUpdate,
    SecurityAlert, UserLeverageSettings,
};

const POSITION_COLUMNS: &str = "id, user_id, pair, side, leverage, entry_price, size, collateral, \
     liquidation_price, current_price, unrealized_pnl, status, opened_at, closed_at, realized_pnl";

/// SQLite implementation of [`PositionStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database and initialize the schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Position store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// In-memory database, used in tests.
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                pair TEXT NOT NULL,
                side TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                entry_price TEXT NOT NULL,
                size TEXT NOT NULL,
                collateral TEXT NOT NULL,
                liquidation_price TEXT NOT NULL,
                current_price TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                status TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                realized_pnl TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_positions_user ON positions(user_id, status);
            CREATE INDEX IF NOT EXISTS idx_positions_pair ON positions(pair, status);

            CREATE TABLE IF NOT EXISTS leverage_settings (
                user_id TEXT PRIMARY KEY,
                auto_deleverage_enabled INTEGER NOT NULL,
                liquidation_warning_enabled INTEGER NOT NULL
            );

            -- Append-only audit trail
            CREATE TABLE IF NOT EXISTS liquidation_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                pair TEXT NOT NULL,
                side TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                entry_price TEXT NOT NULL,
                liquidation_price TEXT NOT NULL,
                size TEXT NOT NULL,
                loss_amount TEXT NOT NULL,
                remaining_collateral TEXT NOT NULL,
                liquidation_type TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_liquidations_user ON liquidation_records(user_id);

            -- Append-only notification records
            CREATE TABLE IF NOT EXISTS security_alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                alert_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                description TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_user ON security_alerts(user_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Insert a position and return its assigned id.
    pub fn insert_position(&self, position: &Position) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO positions (user_id, pair, side, leverage, entry_price, size, collateral,
                                   liquidation_price, current_price, unrealized_pnl, status,
                                   opened_at, closed_at, realized_pnl)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                position.user_id,
                position.pair,
                position.side.as_str(),
                position.leverage,
                position.entry_price.to_string(),
                position.size.to_string(),
                position.collateral.to_string(),
                position.liquidation_price.to_string(),
                position.current_price.to_string(),
                position.unrealized_pnl.to_string(),
                position.status.as_str(),
                position.opened_at.to_rfc3339(),
                position.closed_at.map(|t| t.to_rfc3339()),
                position.realized_pnl.map(|v| v.to_string()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Upsert a user's opt-in flags.
    pub fn set_settings(&self, user_id: &str, settings: UserLeverageSettings) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO leverage_settings (user_id, auto_deleverage_enabled, liquidation_warning_enabled)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id) DO UPDATE SET
                auto_deleverage_enabled = ?2,
                liquidation_warning_enabled = ?3
            "#,
            params![
                user_id,
                settings.auto_deleverage_enabled as i32,
                settings.liquidation_warning_enabled as i32,
            ],
        )?;
        Ok(())
    }

    /// All open positions regardless of owner, for the status view.
    pub fn all_open_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE status = 'open' ORDER BY id"
        ))?;
        let positions = stmt
            .query_map([], row_to_position)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(positions)
    }

    /// All liquidation records, newest first, for the status view.
    pub fn recent_liquidations(&self, limit: usize) -> Result<Vec<LiquidationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT position_id, user_id, pair, side, leverage, entry_price, liquidation_price,
                   size, loss_amount, remaining_collateral, liquidation_type, created_at
            FROM liquidation_records
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;
        let records = stmt
            .query_map([limit], |row| {
                Ok(LiquidationRecord {
                    position_id: row.get(0)?,
                    user_id: row.get(1)?,
                    pair: row.get(2)?,
                    side: parse_side(&row.get::<_, String>(3)?),
                    leverage: row.get(4)?,
                    entry_price: parse_decimal(&row.get::<_, String>(5)?),
                    liquidation_price: parse_decimal(&row.get::<_, String>(6)?),
                    size: parse_decimal(&row.get::<_, String>(7)?),
                    loss_amount: parse_decimal(&row.get::<_, String>(8)?),
                    remaining_collateral: parse_decimal(&row.get::<_, String>(9)?),
                    liquidation_type: if row.get::<_, String>(10)? == "manual" {
                        LiquidationType::Manual
                    } else {
                        LiquidationType::Auto
                    },
                    created_at: parse_timestamp(&row.get::<_, String>(11)?),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }

    fn apply_update(conn: &Connection, id: i64, update: &PositionUpdate) -> Result<()> {
        let existing = conn
            .query_row(
                &format!("SELECT {POSITION_COLUMNS} FROM positions WHERE id = ?1"),
                [id],
                row_to_position,
            )
            .optional()?
            .with_context(|| format!("position {} not found", id))?;

        let current_price = update.current_price.unwrap_or(existing.current_price);
        let unrealized_pnl = update.unrealized_pnl.unwrap_or(existing.unrealized_pnl);
        let status = update.status.unwrap_or(existing.status);
        let closed_at = update.closed_at.or(existing.closed_at);
        let realized_pnl = update.realized_pnl.or(existing.realized_pnl);

        conn.execute(
            r#"
            UPDATE positions
            SET current_price = ?1, unrealized_pnl = ?2, status = ?3, closed_at = ?4, realized_pnl = ?5
            WHERE id = ?6
            "#,
            params![
                current_price.to_string(),
                unrealized_pnl.to_string(),
                status.as_str(),
                closed_at.map(|t| t.to_rfc3339()),
                realized_pnl.map(|v| v.to_string()),
                id,
            ],
        )?;
        Ok(())
    }

    fn append_record(conn: &Connection, record: &LiquidationRecord) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO liquidation_records (position_id, user_id, pair, side, leverage,
                                             entry_price, liquidation_price, size, loss_amount,
                                             remaining_collateral, liquidation_type, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                record.position_id,
                record.user_id,
                record.pair,
                record.side.as_str(),
                record.leverage,
                record.entry_price.to_string(),
                record.liquidation_price.to_string(),
                record.size.to_string(),
                record.loss_amount.to_string(),
                record.remaining_collateral.to_string(),
                record.liquidation_type.as_str(),
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl PositionStore for SqliteStore {
    async fn user_positions(
        &self,
        user_id: &str,
        status: PositionStatus,
    ) -> Result<Vec<Position>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE user_id = ?1 AND status = ?2"
        ))?;
        let positions = stmt
            .query_map(params![user_id, status.as_str()], row_to_position)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(positions)
    }

    async fn positions_by_pair(
        &self,
        pair: &str,
        status: PositionStatus,
    ) -> Result<Vec<Position>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE pair = ?1 AND status = ?2"
        ))?;
        let positions = stmt
            .query_map(params![pair, status.as_str()], row_to_position)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(positions)
    }

    async fn position(&self, id: i64) -> Result<Option<Position>> {
        let conn = self.conn()?;
        let position = conn
            .query_row(
                &format!("SELECT {POSITION_COLUMNS} FROM positions WHERE id = ?1"),
                [id],
                row_to_position,
            )
            .optional()?;
        Ok(position)
    }

    async fn update_position(&self, id: i64, update: PositionUpdate) -> Result<()> {
        let conn = self.conn()?;
        Self::apply_update(&conn, id, &update)
    }

    async fn create_liquidation_record(&self, record: &LiquidationRecord) -> Result<()> {
        let conn = self.conn()?;
        Self::append_record(&conn, record)
    }

    async fn leverage_settings(&self, user_id: &str) -> Result<Option<UserLeverageSettings>> {
        let conn = self.conn()?;
        let settings = conn
            .query_row(
                r#"
                SELECT auto_deleverage_enabled, liquidation_warning_enabled
                FROM leverage_settings WHERE user_id = ?1
                "#,
                [user_id],
                |row| {
                    Ok(UserLeverageSettings {
                        auto_deleverage_enabled: row.get::<_, i32>(0)? != 0,
                        liquidation_warning_enabled: row.get::<_, i32>(1)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(settings)
    }

    async fn create_security_alert(&self, alert: &SecurityAlert) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO security_alerts (user_id, alert_type, severity, description, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                alert.user_id,
                alert.alert_type.as_str(),
                alert.severity.as_str(),
                alert.description,
                alert.metadata.to_string(),
                alert.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // Record append and position close happen in one transaction.
    async fn liquidate(&self, record: &LiquidationRecord, update: PositionUpdate) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        Self::append_record(&tx, record)?;
        Self::apply_update(&tx, record.position_id, &update)?;
        tx.commit()?;
        Ok(())
    }
}

fn parse_decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_side(s: &str) -> PositionSide {
    if s == "short" {
        PositionSide::Short
    } else {
        PositionSide::Long
    }
}

fn parse_status(s: &str) -> PositionStatus {
    match s {
        "liquidated" => PositionStatus::Liquidated,
        "closed" => PositionStatus::Closed,
        _ => PositionStatus::Open,
    }
}

fn row_to_position(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        id: row.get(0)?,
        user_id: row.get(1)?,
        pair: row.get(2)?,
        side: parse_side(&row.get::<_, String>(3)?),
        leverage: row.get(4)?,
        entry_price: parse_decimal(&row.get::<_, String>(5)?),
        size: parse_decimal(&row.get::<_, String>(6)?),
        collateral: parse_decimal(&row.get::<_, String>(7)?),
        liquidation_price: parse_decimal(&row.get::<_, String>(8)?),
        current_price: parse_decimal(&row.get::<_, String>(9)?),
        unrealized_pnl: parse_decimal(&row.get::<_, String>(10)?),
        status: parse_status(&row.get::<_, String>(11)?),
        opened_at: parse_timestamp(&row.get::<_, String>(12)?),
        closed_at: row
            .get::<_, Option<String>>(13)?
            .map(|s| parse_timestamp(&s)),
        realized_pnl: row
            .get::<_, Option<String>>(14)?
            .map(|s| parse_decimal(&s)),
    })
}
