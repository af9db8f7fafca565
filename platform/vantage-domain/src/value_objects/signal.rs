use crate::value_objects::order::OrderType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Hold,
    Buy,
    Sell,
    /// Flatten the current position on the bar's symbol.
    Close,
}

/// Strategy output for one bar. `size` is interpreted by the run's order sizing mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    #[serde(default)]
    pub size: f64,
    #[serde(default = "default_order_type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

fn default_order_type() -> OrderType {
    OrderType::Market
}

fn default_leverage() -> f64 {
    1.0
}

impl Signal {
    pub fn hold() -> Self {
        Self {
            action: SignalAction::Hold,
            size: 0.0,
            order_type: OrderType::Market,
            limit_price: None,
            leverage: 1.0,
            stop_loss: None,
            take_profit: None,
        }
    }

    pub fn buy(size: f64) -> Self {
        Self {
            action: SignalAction::Buy,
            size,
            ..Self::hold()
        }
    }

    pub fn sell(size: f64) -> Self {
        Self {
            action: SignalAction::Sell,
            size,
            ..Self::hold()
        }
    }

    pub fn close() -> Self {
        Self {
            action: SignalAction::Close,
            ..Self::hold()
        }
    }

    pub fn with_leverage(mut self, leverage: f64) -> Self {
        self.leverage = leverage;
        self
    }

    pub fn with_limit(mut self, price: f64) -> Self {
        self.order_type = OrderType::Limit;
        self.limit_price = Some(price);
        self
    }

    pub fn with_stops(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }
}
