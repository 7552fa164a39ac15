//! # Margin Sentinel
//!
//! A leveraged-position risk monitor: continuously evaluates open margin
//! positions, classifies each one's proximity to forced liquidation, and
//! either auto-liquidates or raises alerts depending on per-user
//! settings.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `store`: Position storage and price-feed boundaries (in-memory and
//!   SQLite implementations)
//! - `risk`: Risk classification, liquidation execution, warning
//!   notification, and the monitoring loop
//! - `error`: Caller-visible error types

pub mod config;
pub mod error;
pub mod risk;
pub mod store;

pub use config::Config;
pub use error::MonitorError;
