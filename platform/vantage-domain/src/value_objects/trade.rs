use crate::value_objects::side::Side;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Liquidation,
    Signal,
    Manual,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::Liquidation => "liquidation",
            ExitReason::Signal => "signal",
            ExitReason::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim() {
            "stop_loss" => Ok(ExitReason::StopLoss),
            "take_profit" => Ok(ExitReason::TakeProfit),
            "liquidation" => Ok(ExitReason::Liquidation),
            "signal" => Ok(ExitReason::Signal),
            "manual" => Ok(ExitReason::Manual),
            _ => Err(format!("invalid exit reason: {value}")),
        }
    }
}

/// Closed (or partially closed) round trip. `pnl` is net of the fees and funding attributed to
/// the closed quantity; `pnl_pct` is the return on the initial margin in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: i64,
    pub exit_time: i64,
    pub leverage: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub fees: f64,
    pub funding: f64,
    pub exit_reason: ExitReason,
}

impl Trade {
    /// Price PnL before fees and funding.
    pub fn gross_pnl(&self) -> f64 {
        self.pnl + self.fees + self.funding
    }
}
