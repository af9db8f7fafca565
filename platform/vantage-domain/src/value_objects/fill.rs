use crate::value_objects::side::Side;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liquidity {
    Maker,
    Taker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillKind {
    Open,
    Increase,
    Reduce,
    Close,
    StopLoss,
    TakeProfit,
    Liquidation,
}

impl FillKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FillKind::Open => "open",
            FillKind::Increase => "increase",
            FillKind::Reduce => "reduce",
            FillKind::Close => "close",
            FillKind::StopLoss => "stop_loss",
            FillKind::TakeProfit => "take_profit",
            FillKind::Liquidation => "liquidation",
        }
    }

    pub fn opens_exposure(self) -> bool {
        matches!(self, FillKind::Open | FillKind::Increase)
    }
}

/// Immutable execution record. `side` is the trade direction (`Long` buys, `Short` sells).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// `None` for engine-initiated exits (liquidation, stop-loss, take-profit).
    pub order_id: Option<u64>,
    pub symbol: String,
    pub side: Side,
    pub kind: FillKind,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub liquidity: Liquidity,
    /// Absolute slippage cost relative to the reference price.
    pub slippage: f64,
    /// Funding accrued on the closed portion of the position (zero for opening fills).
    pub funding: f64,
    pub timestamp: i64,
}

impl Fill {
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

/// Periodic funding exchanged on an open perpetual position. Positive `amount` is paid by the account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingPayment {
    pub symbol: String,
    pub side: Side,
    pub timestamp: i64,
    pub rate: f64,
    pub notional: f64,
    pub amount: f64,
}
