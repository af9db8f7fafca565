use serde::{Deserialize, Serialize};

/// What happens to the unfilled part of an intent that hit the bar's liquidity cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemainderPolicy {
    /// Keep the remainder queued for the next bar of the same symbol.
    Carry,
    Cancel,
}

impl RemainderPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RemainderPolicy::Carry => "carry",
            RemainderPolicy::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    /// Adverse price impact applied to taker fills, scaled up by volume participation.
    pub slippage_bps: f64,
    /// Upper bound of the seeded random component added to `slippage_bps` (0 disables it).
    pub slippage_jitter_bps: f64,
    /// Fee rates used when the catalog has no schedule for the market.
    pub maker_fee_bps: f64,
    pub taker_fee_bps: f64,
    /// Fraction of a bar's volume available to this run's fills (0 disables the cap).
    pub max_fill_pct_of_volume: f64,
    pub remainder: RemainderPolicy,
    /// Unfilled limit intents are cancelled after this many bars.
    pub expire_after_bars: Option<u64>,
    /// Overrides the funding cadence derived from the catalog and `bar_seconds`.
    pub funding_interval_bars: Option<u64>,
    pub bar_seconds: i64,
    pub seed: u64,
}

impl ExecutionConfig {
    pub fn simple(taker_fee_bps: f64, slippage_bps: f64) -> Self {
        Self {
            slippage_bps,
            slippage_jitter_bps: 0.0,
            maker_fee_bps: taker_fee_bps,
            taker_fee_bps,
            max_fill_pct_of_volume: 0.0,
            remainder: RemainderPolicy::Carry,
            expire_after_bars: None,
            funding_interval_bars: None,
            bar_seconds: 60,
            seed: 0,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let non_negative = [
            ("slippage_bps", self.slippage_bps),
            ("slippage_jitter_bps", self.slippage_jitter_bps),
            ("maker_fee_bps", self.maker_fee_bps),
            ("taker_fee_bps", self.taker_fee_bps),
            ("max_fill_pct_of_volume", self.max_fill_pct_of_volume),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("execution.{name} must be finite and >= 0"));
            }
        }
        if self.max_fill_pct_of_volume > 1.0 {
            return Err("execution.max_fill_pct_of_volume must be <= 1".to_string());
        }
        if self.bar_seconds <= 0 {
            return Err("execution.bar_seconds must be > 0".to_string());
        }
        if self.funding_interval_bars == Some(0) {
            return Err("execution.funding_interval_bars must be >= 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ExecutionConfig;

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut config = ExecutionConfig::simple(10.0, 5.0);
        assert!(config.validate().is_ok());
        config.max_fill_pct_of_volume = 1.5;
        assert!(config.validate().is_err());
        config.max_fill_pct_of_volume = 0.5;
        config.slippage_bps = -1.0;
        assert!(config.validate().is_err());
    }
}
