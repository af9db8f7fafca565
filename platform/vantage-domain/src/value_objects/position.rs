use crate::value_objects::side::Side;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Isolated,
    Cross,
}

impl MarginMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MarginMode::Isolated => "isolated",
            MarginMode::Cross => "cross",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub margin_mode: MarginMode,
    /// Initial margin posted for the open quantity.
    pub margin: f64,
    pub maintenance_margin_rate: f64,
    pub unrealized_pnl: f64,
    pub liquidation_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub opened_at: i64,
    /// Entry fees not yet attributed to a closed trade.
    pub fees_paid: f64,
    /// Funding not yet attributed to a closed trade.
    pub funding_paid: f64,
}

impl Position {
    pub fn notional_at(&self, price: f64) -> f64 {
        price * self.quantity
    }

    pub fn pnl_at(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * self.quantity
    }

    pub fn mark(&mut self, price: f64) {
        self.unrealized_pnl = self.pnl_at(price);
    }

    /// Price at which `collateral + pnl` equals the maintenance requirement on the marked notional.
    /// `None` when the position cannot be liquidated (e.g. an unlevered long).
    pub fn liquidation_price_for(&self, collateral: f64) -> Option<f64> {
        liquidation_price(
            self.side,
            self.entry_price,
            self.quantity,
            collateral,
            self.maintenance_margin_rate,
        )
    }

    /// Worst price touched by the bar from this position's point of view.
    pub fn adverse_extreme(&self, high: f64, low: f64) -> f64 {
        match self.side {
            Side::Long => low,
            Side::Short => high,
        }
    }

    pub fn crosses(&self, trigger: f64, high: f64, low: f64) -> bool {
        match self.side {
            Side::Long => low <= trigger,
            Side::Short => high >= trigger,
        }
    }
}

pub fn liquidation_price(
    side: Side,
    entry_price: f64,
    quantity: f64,
    collateral: f64,
    maintenance_margin_rate: f64,
) -> Option<f64> {
    if quantity <= 0.0 || !entry_price.is_finite() || !collateral.is_finite() {
        return None;
    }
    let price = match side {
        Side::Long => {
            (entry_price * quantity - collateral) / (quantity * (1.0 - maintenance_margin_rate))
        }
        Side::Short => {
            (entry_price * quantity + collateral) / (quantity * (1.0 + maintenance_margin_rate))
        }
    };
    if price.is_finite() && price > 0.0 {
        Some(price)
    } else {
        None
    }
}
