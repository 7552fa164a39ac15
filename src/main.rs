//! Margin Sentinel - Main Entry Point
//!
//! Default mode runs the monitor against an in-memory store with a
//! simulated price walk, so the full warning/liquidation path can be
//! observed without live data. `status` and `check` inspect a SQLite
//! position database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use margin_sentinel::config::Config;
use margin_sentinel::risk::MonitorEngine;
use margin_sentinel::store::{
    CachedPriceFeed, MemoryStore, Position, PositionSide, PositionStatus, PositionStore,
    SqliteStore, UserLeverageSettings,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Margin Sentinel CLI
#[derive(Parser)]
#[command(name = "margin-sentinel")]
#[command(version, about = "Leveraged-position risk monitor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show open positions and recent liquidations from a database
    Status {
        /// Path to SQLite database (default: data/sentinel.db)
        #[arg(short, long, default_value = "data/sentinel.db")]
        db: String,
    },

    /// One-shot risk check of a single position
    Check {
        /// Position id
        id: i64,

        /// Path to SQLite database (default: data/sentinel.db)
        #[arg(short, long, default_value = "data/sentinel.db")]
        db: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging();

    match cli.command {
        Some(Commands::Status { db }) => return show_status(&db),
        Some(Commands::Check { id, db }) => return check_position(&db, id).await,
        None => {}
    }

    info!("Margin Sentinel v{} - paper monitoring", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    config.validate()?;
    info!(
        interval_secs = config.monitor.interval_secs,
        liquidation_threshold = %config.risk.liquidation_threshold,
        warning_threshold = %config.risk.warning_threshold,
        warning_band = ?config.risk.warning_band,
        "Configuration loaded"
    );

    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(CachedPriceFeed::new());
    seed_demo_positions(&store, &feed).await;

    let engine = Arc::new(MonitorEngine::new(
        store.clone() as Arc<dyn PositionStore>,
        feed.clone(),
        &config,
    ));

    // Walk the ETH price down toward the long's liquidation line so the
    // warning and liquidation paths both fire during a demo run.
    let price_feed = feed.clone();
    let walking = Arc::new(AtomicBool::new(true));
    let walking_task = walking.clone();
    tokio::spawn(async move {
        let mut price = dec!(2400);
        while walking_task.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(10)).await;
            price -= dec!(60);
            if price <= Decimal::ZERO {
                break;
            }
            price_feed.set_price("ETH", price).await;
            info!(price = %price, "Simulated ETH price update");
        }
    });

    let handle = engine.start();

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received");
    engine.stop();
    walking.store(false, Ordering::SeqCst);
    if let Some(handle) = handle {
        handle.await.ok();
    }

    // Summarize what the run produced
    let liquidations = store.liquidation_records().await;
    let alerts = store.security_alerts().await;
    info!(
        liquidations = liquidations.len(),
        alerts = alerts.len(),
        "Run complete"
    );

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn seed_demo_positions(store: &MemoryStore, feed: &CachedPriceFeed) {
    feed.set_price("ETH", dec!(2400)).await;
    feed.set_price("BTC", dec!(60000)).await;

    store
        .set_settings(
            "alice",
            UserLeverageSettings {
                auto_deleverage_enabled: true,
                liquidation_warning_enabled: true,
            },
        )
        .await;
    store
        .set_settings(
            "bob",
            UserLeverageSettings {
                auto_deleverage_enabled: false,
                liquidation_warning_enabled: true,
            },
        )
        .await;

    // Long heading toward its liquidation line as the walk descends
    store
        .insert_position(Position {
            id: 0,
            user_id: "alice".to_string(),
            pair: "ETH/USDT".to_string(),
            side: PositionSide::Long,
            leverage: 10,
            entry_price: dec!(2400),
            size: dec!(1),
            collateral: dec!(240),
            liquidation_price: dec!(2160),
            current_price: dec!(2400),
            unrealized_pnl: Decimal::ZERO,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            realized_pnl: None,
        })
        .await;

    // Comfortable short that should stay safe
    store
        .insert_position(Position {
            id: 0,
            user_id: "bob".to_string(),
            pair: "BTC/USDT".to_string(),
            side: PositionSide::Short,
            leverage: 5,
            entry_price: dec!(60000),
            size: dec!(0.1),
            collateral: dec!(1200),
            liquidation_price: dec!(72000),
            current_price: dec!(60000),
            unrealized_pnl: Decimal::ZERO,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            realized_pnl: None,
        })
        .await;

    info!("Seeded 2 demo positions for users alice and bob");
}

fn show_status(db_path: &str) -> Result<()> {
    let store = SqliteStore::new(db_path)?;

    let positions = store.all_open_positions()?;
    println!("Open positions: {}", positions.len());
    for pos in &positions {
        println!(
            "  #{:<4} {:<12} {:<5} {}x entry {} liq {} mark {} upnl {}",
            pos.id,
            pos.pair,
            pos.side.as_str(),
            pos.leverage,
            pos.entry_price,
            pos.liquidation_price,
            pos.current_price,
            pos.unrealized_pnl,
        );
    }

    let liquidations = store.recent_liquidations(10)?;
    println!("\nRecent liquidations: {}", liquidations.len());
    for rec in &liquidations {
        println!(
            "  #{:<4} {:<12} {:<5} loss {} remaining {} ({})",
            rec.position_id,
            rec.pair,
            rec.side.as_str(),
            rec.loss_amount,
            rec.remaining_collateral,
            rec.liquidation_type.as_str(),
        );
    }

    Ok(())
}

async fn check_position(db_path: &str, id: i64) -> Result<()> {
    let config = Config::default();
    let store = Arc::new(SqliteStore::new(db_path)?);

    // Offline check: serve each position's last observed mark as the quote.
    let feed = Arc::new(CachedPriceFeed::new());
    match store.position(id).await? {
        Some(pos) if pos.current_price > Decimal::ZERO => {
            feed.set_price(pos.base_asset(), pos.current_price).await;
        }
        Some(_) => warn!(position_id = id, "Position has no recorded mark price"),
        None => {}
    }

    let engine = MonitorEngine::new(store as Arc<dyn PositionStore>, feed, &config);
    match engine.check_position(id).await {
        Ok(assessment) => {
            println!(
                "position {} ({}) risk: {} | mark {} liq {} distance {:.2}%",
                assessment.position_id,
                assessment.pair,
                assessment.risk_level.as_str(),
                assessment.current_price,
                assessment.liquidation_price,
                assessment.distance_to_liquidation,
            );
        }
        Err(e) => {
            error!("Check failed: {e:#}");
            return Err(e);
        }
    }

    Ok(())
}
