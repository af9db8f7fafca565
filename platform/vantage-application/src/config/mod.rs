use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub run: RunConfig,
    pub data: DataConfig,
    pub costs: CostsConfig,
    pub risk: RiskConfig,
    pub orders: Option<OrdersConfig>,
    pub execution: Option<ExecutionConfig>,
    pub strategy: Option<StrategyConfig>,
    pub metrics: Option<MetricsConfig>,
    pub data_quality: Option<DataQualityConfig>,
    pub rate_limits: Option<RateLimitsConfig>,
    pub exchange: Option<ExchangeConfig>,
    pub paper: Option<PaperConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub run_id: String,
    pub symbol: String,
    pub timeframe: String,
    pub initial_capital: f64,
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    pub ohlcv_path: String,
    pub catalog_path: Option<String>,
    pub out_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CostsConfig {
    /// Taker fee; also used for maker fills when `maker_fee_bps` is unset.
    pub fee_bps: f64,
    pub maker_fee_bps: Option<f64>,
    pub slippage_bps: f64,
    pub slippage_jitter_bps: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RiskConfig {
    pub max_open_positions: Option<usize>,
    pub max_leverage: f64,
    pub max_position_pct: f64,
    pub daily_loss_limit_pct: f64,
    pub max_drawdown_pct: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct OrdersConfig {
    pub size_mode: Option<String>,
    pub margin_mode: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    pub max_fill_pct_of_volume: Option<f64>,
    pub remainder: Option<String>,
    pub expire_after_bars: Option<u64>,
    pub funding_interval_bars: Option<u64>,
}

/// Baseline strategies that drive a run. Selected with `kind`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum StrategyConfig {
    Hold,
    BuyAndHold {
        size: f64,
        leverage: Option<f64>,
        stop_loss_pct: Option<f64>,
        take_profit_pct: Option<f64>,
    },
    SmaCross {
        short_window: usize,
        long_window: usize,
        size: f64,
        leverage: Option<f64>,
        allow_short: Option<bool>,
        stop_loss_pct: Option<f64>,
        take_profit_pct: Option<f64>,
    },
}

impl StrategyConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StrategyConfig::Hold => "hold",
            StrategyConfig::BuyAndHold { .. } => "buy_and_hold",
            StrategyConfig::SmaCross { .. } => "sma_cross",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    pub risk_free_rate: Option<f64>,
    pub annualization_factor: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DataQualityConfig {
    pub max_gaps: Option<usize>,
    pub max_duplicates: Option<usize>,
    pub max_out_of_order: Option<usize>,
    pub max_invalid_bars: Option<usize>,
    pub max_zero_volume: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RateLimitsConfig {
    /// `standard` or `vip`.
    pub tier: Option<String>,
    pub orders: Option<BucketConfig>,
    pub account: Option<BucketConfig>,
    pub market_data: Option<BucketConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ExchangeConfig {
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub call_deadline_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PaperConfig {
    /// `replay` paces the CSV bars; `poll` reads closed candles from the exchange.
    pub source: Option<String>,
    pub replay_scale: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub max_bars: Option<u64>,
}

pub fn load_config(path: &Path) -> Result<Config, String> {
    let (config, _source) = load_config_with_source(path)?;
    Ok(config)
}

pub fn load_config_with_source(path: &Path) -> Result<(Config, String), String> {
    let contents = fs::read_to_string(path)
        .map_err(|err| format!("failed to read config {}: {}", path.display(), err))?;
    let config = parse_config(&contents)
        .map_err(|err| format!("invalid config {}: {}", path.display(), err))?;
    Ok((config, contents))
}

/// Parses and validates a config document.
pub fn parse_config(contents: &str) -> Result<Config, String> {
    let config: Config =
        toml::from_str(contents).map_err(|err| format!("failed to parse TOML: {err}"))?;
    validate_config(&config)?;
    Ok(config)
}

pub fn to_toml_pretty(config: &Config) -> Result<String, String> {
    toml::to_string_pretty(config)
        .map_err(|err| format!("failed to serialize config as TOML: {err}"))
}

pub fn validate_config(config: &Config) -> Result<(), String> {
    if config.run.run_id.trim().is_empty() {
        return Err("run.run_id cannot be empty".to_string());
    }
    if config.run.symbol.trim().is_empty() {
        return Err("run.symbol cannot be empty".to_string());
    }
    if !config.run.initial_capital.is_finite() || config.run.initial_capital <= 0.0 {
        return Err("run.initial_capital must be > 0".to_string());
    }

    let fractions = [
        ("risk.max_position_pct", config.risk.max_position_pct),
        ("risk.daily_loss_limit_pct", config.risk.daily_loss_limit_pct),
        ("risk.max_drawdown_pct", config.risk.max_drawdown_pct),
    ];
    for (name, value) in fractions {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(format!("{name} must be within [0, 1]"));
        }
    }
    if !config.risk.max_leverage.is_finite() || config.risk.max_leverage < 1.0 {
        return Err("risk.max_leverage must be >= 1".to_string());
    }

    match &config.strategy {
        None | Some(StrategyConfig::Hold) => {}
        Some(StrategyConfig::BuyAndHold {
            size,
            leverage,
            stop_loss_pct,
            take_profit_pct,
        }) => {
            validate_entry("strategy", *size, *leverage, *stop_loss_pct, *take_profit_pct)?;
        }
        Some(StrategyConfig::SmaCross {
            short_window,
            long_window,
            size,
            leverage,
            stop_loss_pct,
            take_profit_pct,
            ..
        }) => {
            if *short_window == 0 || *long_window == 0 {
                return Err("strategy windows must be >= 1".to_string());
            }
            if short_window >= long_window {
                return Err("strategy.short_window must be < strategy.long_window".to_string());
            }
            validate_entry("strategy", *size, *leverage, *stop_loss_pct, *take_profit_pct)?;
        }
    }

    if let Some(limits) = &config.rate_limits {
        for (name, bucket) in [
            ("orders", limits.orders),
            ("account", limits.account),
            ("market_data", limits.market_data),
        ] {
            if let Some(bucket) = bucket {
                if !(bucket.capacity >= 1.0) {
                    return Err(format!("rate_limits.{name}.capacity must be >= 1"));
                }
                if !(bucket.refill_per_sec > 0.0) || !bucket.refill_per_sec.is_finite() {
                    return Err(format!("rate_limits.{name}.refill_per_sec must be > 0"));
                }
            }
        }
    }

    Ok(())
}

fn validate_entry(
    section: &str,
    size: f64,
    leverage: Option<f64>,
    stop_loss_pct: Option<f64>,
    take_profit_pct: Option<f64>,
) -> Result<(), String> {
    if !size.is_finite() || size <= 0.0 {
        return Err(format!("{section}.size must be > 0"));
    }
    if let Some(leverage) = leverage {
        if !leverage.is_finite() || leverage < 1.0 {
            return Err(format!("{section}.leverage must be >= 1"));
        }
    }
    for (name, value) in [
        ("stop_loss_pct", stop_loss_pct),
        ("take_profit_pct", take_profit_pct),
    ] {
        if let Some(value) = value {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("{section}.{name} must be > 0"));
            }
        }
    }
    Ok(())
}
