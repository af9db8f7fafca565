use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use vantage_domain::entities::catalog::{MarketCatalog, MarketSpec};
use vantage_domain::repositories::catalog::CatalogRepository;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogDocument {
    Wrapped { markets: Vec<MarketSpec> },
    Bare(Vec<MarketSpec>),
}

/// Market catalog stored as JSON: `{"markets": [...]}` or a bare array of markets.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCatalogRepository;

impl JsonCatalogRepository {
    pub fn new() -> Self {
        Self
    }
}

impl CatalogRepository for JsonCatalogRepository {
    fn load_catalog(&self, path: &Path) -> Result<MarketCatalog, String> {
        let contents = fs::read_to_string(path)
            .map_err(|err| format!("failed to read catalog {}: {}", path.display(), err))?;
        let catalog = parse_catalog(&contents)
            .map_err(|err| format!("invalid catalog {}: {}", path.display(), err))?;
        metrics::gauge!("vantage.infra.catalog.markets").set(catalog.len() as f64);
        tracing::debug!(path = %path.display(), markets = catalog.len(), "catalog loaded");
        Ok(catalog)
    }
}

pub fn parse_catalog(contents: &str) -> Result<MarketCatalog, String> {
    let document: CatalogDocument =
        serde_json::from_str(contents).map_err(|err| format!("malformed json: {err}"))?;
    let mut markets = match document {
        CatalogDocument::Wrapped { markets } => markets,
        CatalogDocument::Bare(markets) => markets,
    };

    let mut seen = BTreeSet::new();
    for market in markets.iter_mut() {
        validate_market(market)?;
        if !seen.insert(market.symbol.clone()) {
            return Err(format!("duplicate market symbol: {}", market.symbol));
        }
        market
            .maintenance_tiers
            .sort_by(|a, b| a.notional_floor.total_cmp(&b.notional_floor));
    }
    Ok(MarketCatalog::new(markets))
}

fn validate_market(market: &MarketSpec) -> Result<(), String> {
    let symbol = market.symbol.trim();
    if symbol.is_empty() {
        return Err("market symbol must not be empty".to_string());
    }
    let non_negative = [
        ("tickSize", market.tick_size),
        ("lotSize", market.lot_size),
        ("minNotional", market.min_notional),
    ];
    for (name, value) in non_negative {
        if !value.is_finite() || value < 0.0 {
            return Err(format!("{symbol}: {name} must be >= 0 (got {value})"));
        }
    }
    if !market.max_leverage.is_finite() || market.max_leverage < 1.0 {
        return Err(format!(
            "{symbol}: maxLeverage must be >= 1 (got {})",
            market.max_leverage
        ));
    }
    for tier in &market.maintenance_tiers {
        if !(0.0..1.0).contains(&tier.maintenance_margin_rate) || tier.notional_floor < 0.0 {
            return Err(format!(
                "{symbol}: invalid maintenance tier (floor {}, rate {})",
                tier.notional_floor, tier.maintenance_margin_rate
            ));
        }
    }
    if let Some(fees) = market.fees_bps {
        if !fees.maker.is_finite() || !fees.taker.is_finite() || fees.taker < 0.0 {
            return Err(format!(
                "{symbol}: invalid feesBps (maker {}, taker {})",
                fees.maker, fees.taker
            ));
        }
    }
    Ok(())
}
