use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_MAINTENANCE_MARGIN_RATE: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractType {
    Spot,
    Perpetual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Trading,
    Paused,
    Delisted,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceTier {
    /// Lower bound (inclusive) of position notional this rate applies to.
    pub notional_floor: f64,
    pub maintenance_margin_rate: f64,
}

impl MaintenanceTier {
    /// Tiered table used for perpetual markets without an explicit one.
    pub fn default_table() -> Vec<MaintenanceTier> {
        [
            (0.0, 0.005),
            (50_000.0, 0.01),
            (250_000.0, 0.025),
            (1_000_000.0, 0.05),
            (5_000_000.0, 0.10),
        ]
        .into_iter()
        .map(|(notional_floor, maintenance_margin_rate)| MaintenanceTier {
            notional_floor,
            maintenance_margin_rate,
        })
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub maker: f64,
    pub taker: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingSpec {
    #[serde(default = "default_funding_interval_hours")]
    pub interval_hours: u32,
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub rate_cap: Option<f64>,
}

fn default_funding_interval_hours() -> u32 {
    8
}

fn default_status() -> MarketStatus {
    MarketStatus::Trading
}

fn default_contract_type() -> ContractType {
    ContractType::Spot
}

fn default_max_leverage() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSpec {
    pub symbol: String,
    #[serde(default)]
    pub base: String,
    #[serde(default)]
    pub quote: String,
    #[serde(default = "default_contract_type")]
    pub contract_type: ContractType,
    #[serde(default = "default_status")]
    pub status: MarketStatus,
    #[serde(default)]
    pub tick_size: f64,
    #[serde(default)]
    pub lot_size: f64,
    #[serde(default)]
    pub min_notional: f64,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    #[serde(default, alias = "maintenanceMarginTable")]
    pub maintenance_tiers: Vec<MaintenanceTier>,
    #[serde(default)]
    pub fees_bps: Option<FeeSchedule>,
    #[serde(default)]
    pub funding: Option<FundingSpec>,
}

impl MarketSpec {
    /// Permissive spec used when a symbol has no catalog entry: no quantization, no funding.
    pub fn unrestricted(symbol: &str, max_leverage: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            base: String::new(),
            quote: String::new(),
            contract_type: ContractType::Spot,
            status: MarketStatus::Trading,
            tick_size: 0.0,
            lot_size: 0.0,
            min_notional: 0.0,
            max_leverage,
            maintenance_tiers: Vec::new(),
            fees_bps: None,
            funding: None,
        }
    }

    pub fn is_trading(&self) -> bool {
        self.status == MarketStatus::Trading
    }

    pub fn is_perpetual(&self) -> bool {
        self.contract_type == ContractType::Perpetual
    }

    pub fn maintenance_margin_rate(&self, notional: f64) -> f64 {
        let defaults;
        let tiers = if self.maintenance_tiers.is_empty() {
            if !self.is_perpetual() {
                return DEFAULT_MAINTENANCE_MARGIN_RATE;
            }
            defaults = MaintenanceTier::default_table();
            &defaults
        } else {
            &self.maintenance_tiers
        };
        tiers
            .iter()
            .filter(|tier| tier.notional_floor <= notional)
            .max_by(|a, b| a.notional_floor.total_cmp(&b.notional_floor))
            .map(|tier| tier.maintenance_margin_rate)
            .unwrap_or(DEFAULT_MAINTENANCE_MARGIN_RATE)
    }

    /// Floors `quantity` to the lot size.
    pub fn quantize_quantity(&self, quantity: f64) -> f64 {
        if self.lot_size <= 0.0 {
            return quantity;
        }
        let lots = (quantity / self.lot_size + 1e-9).floor();
        lots * self.lot_size
    }

    /// Rounds `price` to the nearest tick.
    pub fn quantize_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        (price / self.tick_size).round() * self.tick_size
    }

    /// Funding rate per interval, clamped to the configured cap.
    pub fn funding_rate(&self) -> f64 {
        let Some(funding) = self.funding else {
            return 0.0;
        };
        match funding.rate_cap {
            Some(cap) if cap >= 0.0 => funding.rate.clamp(-cap, cap),
            _ => funding.rate,
        }
    }

    pub fn funding_interval_seconds(&self) -> Option<i64> {
        self.funding
            .filter(|_| self.is_perpetual())
            .map(|funding| i64::from(funding.interval_hours.max(1)) * 3600)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketCatalog {
    markets: BTreeMap<String, MarketSpec>,
}

impl MarketCatalog {
    pub fn new(markets: Vec<MarketSpec>) -> Self {
        Self {
            markets: markets
                .into_iter()
                .map(|market| (market.symbol.clone(), market))
                .collect(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&MarketSpec> {
        self.markets.get(symbol)
    }

    pub fn insert(&mut self, market: MarketSpec) {
        self.markets.insert(market.symbol.clone(), market);
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.markets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}
