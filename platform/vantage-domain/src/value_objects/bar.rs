use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Checks OHLC consistency. Returns a short reason code when the bar cannot be simulated.
    pub fn validate(&self) -> Result<(), &'static str> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) || !self.volume.is_finite() {
            return Err("non_finite_value");
        }
        if prices.iter().any(|p| *p <= 0.0) {
            return Err("non_positive_price");
        }
        if self.high < self.low {
            return Err("high_below_low");
        }
        if self.high < self.open.max(self.close) || self.low > self.open.min(self.close) {
            return Err("open_close_outside_range");
        }
        if self.volume < 0.0 {
            return Err("negative_volume");
        }
        Ok(())
    }
}
