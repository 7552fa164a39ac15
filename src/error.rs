//! Caller-visible error types.
//!
//! Most failures inside a monitoring pass are logged and contained per
//! user or per position; these variants are the ones the query API
//! propagates to its caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("position {0} not found")]
    PositionNotFound(i64),

    #[error("no price available for {0}")]
    PriceUnavailable(String),
}
