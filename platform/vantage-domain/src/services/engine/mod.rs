pub mod backtest;
pub mod execution;
pub mod simulator;

use crate::value_objects::bar::Bar;
use thiserror::Error;

/// Conditions that make a simulation untrustworthy. The run aborts instead of continuing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvariantViolation {
    #[error("bar for {symbol} at {timestamp} is not after the previous bar at {previous}")]
    BarOutOfOrder {
        symbol: String,
        previous: i64,
        timestamp: i64,
    },
    #[error("malformed bar for {symbol} at {timestamp}: {reason}")]
    MalformedBar {
        symbol: String,
        timestamp: i64,
        reason: &'static str,
    },
    #[error("negative or non-finite quantity {quantity} for {symbol} (order {order_id:?})")]
    NegativeQuantity {
        symbol: String,
        order_id: Option<u64>,
        quantity: f64,
    },
    #[error("{0}")]
    EquityOrder(String),
}

impl InvariantViolation {
    pub fn malformed(bar: &Bar, reason: &'static str) -> Self {
        InvariantViolation::MalformedBar {
            symbol: bar.symbol.clone(),
            timestamp: bar.timestamp,
            reason,
        }
    }
}
