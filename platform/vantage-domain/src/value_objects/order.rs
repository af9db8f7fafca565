use crate::value_objects::position::MarginMode;
use crate::value_objects::side::Side;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Who asked for the order. Reducing fills from manual intents close with `ExitReason::Manual`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentOrigin {
    Strategy,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub id: u64,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub leverage: f64,
    pub margin_mode: MarginMode,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub origin: IntentOrigin,
    pub submitted_at: i64,
    /// Number of bars this intent has been queued without completing.
    #[serde(default)]
    pub bars_waited: u64,
}

impl OrderIntent {
    pub fn market(id: u64, symbol: &str, side: Side, quantity: f64, submitted_at: i64) -> Self {
        Self {
            id,
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
            leverage: 1.0,
            margin_mode: MarginMode::Isolated,
            stop_loss: None,
            take_profit: None,
            origin: IntentOrigin::Strategy,
            submitted_at,
            bars_waited: 0,
        }
    }

    pub fn limit(
        id: u64,
        symbol: &str,
        side: Side,
        quantity: f64,
        limit_price: f64,
        submitted_at: i64,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            ..Self::market(id, symbol, side, quantity, submitted_at)
        }
    }

    pub fn with_leverage(mut self, leverage: f64) -> Self {
        self.leverage = leverage;
        self
    }

    pub fn with_margin_mode(mut self, margin_mode: MarginMode) -> Self {
        self.margin_mode = margin_mode;
        self
    }

    pub fn with_stops(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_origin(mut self, origin: IntentOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn is_buy(&self) -> bool {
        self.side == Side::Long
    }
}
