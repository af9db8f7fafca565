use crate::config::{Config, StrategyConfig};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use vantage_domain::entities::catalog::MarketCatalog;
use vantage_domain::entities::metrics::MetricsConfig;
use vantage_domain::entities::risk::RiskConfig;
use vantage_domain::repositories::artifacts::ArtifactWriter;
use vantage_domain::repositories::catalog::CatalogRepository;
use vantage_domain::services::audit::{sort_events, AuditEvent};
use vantage_domain::services::engine::backtest::{
    BacktestResults, BacktestRunError, BacktestSettings, OrderSizeMode,
};
use vantage_domain::services::engine::execution::{ExecutionConfig, RemainderPolicy};
use vantage_domain::services::strategy::{
    BuyAndHold, ExitOffsets, HoldStrategy, SmaCross, StrategyKind,
};
use vantage_domain::value_objects::equity_point::EquityPoint;
use vantage_domain::value_objects::position::MarginMode;
use vantage_domain::value_objects::timeframe::Timeframe;
use vantage_domain::value_objects::trade::Trade;

pub const TRADES_FILE: &str = "trades.csv";
pub const FILLS_FILE: &str = "fills.csv";
pub const EQUITY_FILE: &str = "equity.csv";
pub const SUMMARY_FILE: &str = "summary.json";
pub const AUDIT_FILE: &str = "audit.jsonl";
pub const CONFIG_FILE: &str = "config.toml";

const SECONDS_PER_YEAR: f64 = 31_536_000.0;

pub fn resolve_timeframe(config: &Config) -> Result<Timeframe, String> {
    Timeframe::parse(&config.run.timeframe)
}

pub fn resolve_size_mode(config: &Config) -> Result<OrderSizeMode, String> {
    match config
        .orders
        .as_ref()
        .and_then(|orders| orders.size_mode.as_deref())
        .map(|s| s.trim().to_lowercase())
        .as_deref()
    {
        None | Some("qty") | Some("quantity") => Ok(OrderSizeMode::Quantity),
        Some("pct_equity") | Some("equity_pct") | Some("pct") => Ok(OrderSizeMode::PctEquity),
        Some(other) => Err(format!(
            "orders.size_mode must be: qty|pct_equity (got {other})"
        )),
    }
}

pub fn resolve_margin_mode(config: &Config) -> Result<MarginMode, String> {
    match config
        .orders
        .as_ref()
        .and_then(|orders| orders.margin_mode.as_deref())
        .map(|s| s.trim().to_lowercase())
        .as_deref()
    {
        None | Some("isolated") => Ok(MarginMode::Isolated),
        Some("cross") => Ok(MarginMode::Cross),
        Some(other) => Err(format!(
            "orders.margin_mode must be: isolated|cross (got {other})"
        )),
    }
}

pub fn resolve_execution_config(config: &Config) -> Result<ExecutionConfig, String> {
    let timeframe = resolve_timeframe(config)?;
    let section = config.execution.as_ref();

    let remainder = match section
        .and_then(|e| e.remainder.as_deref())
        .map(|s| s.trim().to_lowercase())
        .as_deref()
    {
        None | Some("carry") => RemainderPolicy::Carry,
        Some("cancel") => RemainderPolicy::Cancel,
        Some(_) => return Err("execution.remainder must be: carry|cancel".to_string()),
    };

    let execution = ExecutionConfig {
        slippage_bps: config.costs.slippage_bps,
        slippage_jitter_bps: config.costs.slippage_jitter_bps.unwrap_or(0.0),
        maker_fee_bps: config.costs.maker_fee_bps.unwrap_or(config.costs.fee_bps),
        taker_fee_bps: config.costs.fee_bps,
        max_fill_pct_of_volume: section
            .and_then(|e| e.max_fill_pct_of_volume)
            .unwrap_or(0.0),
        remainder,
        expire_after_bars: section.and_then(|e| e.expire_after_bars),
        funding_interval_bars: section.and_then(|e| e.funding_interval_bars),
        bar_seconds: timeframe.step_seconds,
        seed: config.run.seed.unwrap_or(0),
    };
    execution.validate()?;
    Ok(execution)
}

/// Metrics settings for a run. Without an explicit `annualization_factor` the Sharpe ratio is
/// annualized by the number of bars per 365-day year at the run's timeframe.
pub fn build_metrics_config(config: &Config) -> MetricsConfig {
    let defaults = MetricsConfig::default();
    let metrics = config.metrics.as_ref();
    let bars_per_year = resolve_timeframe(config)
        .ok()
        .filter(|timeframe| timeframe.step_seconds > 0)
        .map(|timeframe| SECONDS_PER_YEAR / timeframe.step_seconds as f64);
    MetricsConfig {
        risk_free_rate: metrics
            .and_then(|m| m.risk_free_rate)
            .unwrap_or(defaults.risk_free_rate),
        annualization_factor: metrics
            .and_then(|m| m.annualization_factor)
            .or(bars_per_year)
            .or(defaults.annualization_factor),
    }
}

pub fn build_risk_config(config: &Config) -> RiskConfig {
    RiskConfig {
        max_open_positions: config.risk.max_open_positions.unwrap_or(0),
        max_leverage: config.risk.max_leverage,
        max_position_pct: config.risk.max_position_pct,
        daily_loss_limit_pct: config.risk.daily_loss_limit_pct,
        max_drawdown_pct: config.risk.max_drawdown_pct,
    }
}

pub fn build_strategy(config: &Config) -> StrategyKind {
    match config.strategy.as_ref() {
        None | Some(StrategyConfig::Hold) => StrategyKind::Hold(HoldStrategy),
        Some(StrategyConfig::BuyAndHold {
            size,
            leverage,
            stop_loss_pct,
            take_profit_pct,
        }) => StrategyKind::BuyAndHold(BuyAndHold::new(
            *size,
            leverage.unwrap_or(1.0),
            ExitOffsets {
                stop_loss_pct: *stop_loss_pct,
                take_profit_pct: *take_profit_pct,
            },
        )),
        Some(StrategyConfig::SmaCross {
            short_window,
            long_window,
            size,
            leverage,
            allow_short,
            stop_loss_pct,
            take_profit_pct,
        }) => StrategyKind::SmaCross(SmaCross::new(
            *short_window,
            *long_window,
            *size,
            leverage.unwrap_or(1.0),
            allow_short.unwrap_or(false),
            ExitOffsets {
                stop_loss_pct: *stop_loss_pct,
                take_profit_pct: *take_profit_pct,
            },
        )),
    }
}

pub fn build_settings(
    config: &Config,
    execution: &ExecutionConfig,
) -> Result<BacktestSettings, String> {
    Ok(BacktestSettings {
        run_id: config.run.run_id.clone(),
        initial_capital: config.run.initial_capital,
        size_mode: resolve_size_mode(config)?,
        margin_mode: resolve_margin_mode(config)?,
        metrics: build_metrics_config(config),
        risk: build_risk_config(config),
        execution: execution.clone(),
    })
}

pub fn load_catalog(
    config: &Config,
    catalog_repo: &dyn CatalogRepository,
) -> Result<MarketCatalog, String> {
    match config.data.catalog_path.as_deref() {
        Some(path) => catalog_repo.load_catalog(PathBuf::from(path).as_path()),
        None => Ok(MarketCatalog::default()),
    }
}

/// SHA-256 over the serialized trades and equity curve. Identical runs produce identical values.
pub fn run_fingerprint(trades: &[Trade], equity: &[EquityPoint]) -> Result<String, String> {
    let trades_json = serde_json::to_vec(trades)
        .map_err(|err| format!("failed to serialize trades for fingerprint: {err}"))?;
    let equity_json = serde_json::to_vec(equity)
        .map_err(|err| format!("failed to serialize equity for fingerprint: {err}"))?;
    let mut hasher = Sha256::new();
    hasher.update(&trades_json);
    hasher.update(b"\n");
    hasher.update(&equity_json);
    Ok(to_hex(&hasher.finalize()))
}

pub fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

pub fn summary_meta_json(
    config: &Config,
    mode: &str,
    trades: &[Trade],
    equity: &[EquityPoint],
) -> Result<serde_json::Value, String> {
    Ok(serde_json::json!({
        "run_id": config.run.run_id,
        "mode": mode,
        "symbol": config.run.symbol,
        "timeframe": config.run.timeframe,
        "seed": config.run.seed.unwrap_or(0),
        "strategy": config.strategy.as_ref().map(StrategyConfig::kind).unwrap_or("hold"),
        "initial_capital": config.run.initial_capital,
        "start": equity.first().map(|p| p.timestamp),
        "end": equity.last().map(|p| p.timestamp),
        "fingerprint": {
            "algorithm": "sha256",
            "trades_equity": run_fingerprint(trades, equity)?,
        },
    }))
}

pub fn config_snapshot_json(config: &Config, execution: &ExecutionConfig) -> serde_json::Value {
    serde_json::json!({
        "data": {
            "ohlcv_path": config.data.ohlcv_path,
            "catalog_path": config.data.catalog_path,
        },
        "execution": {
            "slippage_bps": execution.slippage_bps,
            "slippage_jitter_bps": execution.slippage_jitter_bps,
            "maker_fee_bps": execution.maker_fee_bps,
            "taker_fee_bps": execution.taker_fee_bps,
            "max_fill_pct_of_volume": execution.max_fill_pct_of_volume,
            "remainder": execution.remainder.as_str(),
            "expire_after_bars": execution.expire_after_bars,
            "funding_interval_bars": execution.funding_interval_bars,
            "bar_seconds": execution.bar_seconds,
            "seed": execution.seed,
        },
        "risk": {
            "max_open_positions": config.risk.max_open_positions.unwrap_or(0),
            "max_leverage": config.risk.max_leverage,
            "max_position_pct": config.risk.max_position_pct,
            "daily_loss_limit_pct": config.risk.daily_loss_limit_pct,
            "max_drawdown_pct": config.risk.max_drawdown_pct,
        },
        "orders": {
            "size_mode": config.orders.as_ref().and_then(|o| o.size_mode.as_deref()).unwrap_or("qty"),
            "margin_mode": config.orders.as_ref().and_then(|o| o.margin_mode.as_deref()).unwrap_or("isolated"),
        },
        "strategy": config.strategy,
        "metrics": {
            "risk_free_rate": build_metrics_config(config).risk_free_rate,
            "annualization_factor": build_metrics_config(config).annualization_factor,
        },
    })
}

pub fn timing_event(
    run_id: &str,
    timestamp: i64,
    symbol: Option<&str>,
    action: &str,
    duration_ms: u64,
    details: serde_json::Value,
) -> AuditEvent {
    AuditEvent {
        run_id: run_id.to_string(),
        timestamp,
        stage: "timing".to_string(),
        symbol: symbol.map(|s| s.to_string()),
        action: action.to_string(),
        error: None,
        details: serde_json::json!({
            "duration_ms": duration_ms,
            "details": details,
        }),
    }
}

/// Maps an engine failure to the use-case error, keeping the diagnostic state of aborted runs.
pub fn describe_run_error(mode: &str, err: BacktestRunError) -> String {
    match err {
        BacktestRunError::Cancelled { bars_processed } => {
            format!("{mode} run cancelled after {bars_processed} bars")
        }
        BacktestRunError::Invariant {
            violation,
            last_state,
            offending_bar,
        } => {
            let state = serde_json::to_string(&last_state).unwrap_or_default();
            let bar = offending_bar
                .and_then(|bar| serde_json::to_string(&bar).ok())
                .unwrap_or_else(|| "null".to_string());
            format!("{mode} run aborted: {violation}; last_state={state}; offending_bar={bar}")
        }
    }
}

pub fn record_run_metrics(mode: &str, results: &BacktestResults, engine_ms: f64) {
    let rejects = results
        .audit_events
        .iter()
        .filter(|event| event.stage == "risk" && event.action == "reject")
        .count();
    metrics::histogram!("vantage.engine_ms", "mode" => mode.to_string()).record(engine_ms);
    metrics::counter!("vantage.backtest.bars_total", "mode" => mode.to_string())
        .increment(results.summary.bars_processed as u64);
    metrics::counter!("vantage.risk.rejects_total", "mode" => mode.to_string())
        .increment(rejects as u64);
    metrics::gauge!("vantage.trades", "mode" => mode.to_string())
        .set(results.summary.trades as f64);
    metrics::gauge!("vantage.liquidations", "mode" => mode.to_string())
        .set(results.summary.liquidations as f64);
}

#[allow(clippy::too_many_arguments)]
pub fn write_outputs(
    config: &Config,
    config_toml: &str,
    out: Option<PathBuf>,
    mode: &str,
    results: BacktestResults,
    execution: &ExecutionConfig,
    artifacts: &dyn ArtifactWriter,
    mut audit_extras: Vec<AuditEvent>,
) -> Result<PathBuf, String> {
    let base_dir = out.unwrap_or_else(|| PathBuf::from(&config.data.out_dir));
    let run_dir = base_dir.join(&config.run.run_id);
    artifacts.ensure_dir(&run_dir)?;

    artifacts.write_trades_csv(run_dir.join(TRADES_FILE).as_path(), &results.trades)?;
    artifacts.write_fills_csv(run_dir.join(FILLS_FILE).as_path(), &results.fills)?;
    artifacts.write_equity_csv(run_dir.join(EQUITY_FILE).as_path(), &results.equity)?;

    let meta = summary_meta_json(config, mode, &results.trades, &results.equity)?;
    let config_snapshot = config_snapshot_json(config, execution);
    artifacts.write_summary_json(
        run_dir.join(SUMMARY_FILE).as_path(),
        &results.summary,
        Some(&meta),
        Some(&config_snapshot),
    )?;

    let mut audit_events = results.audit_events;
    audit_events.append(&mut audit_extras);
    sort_events(&mut audit_events);
    artifacts.write_audit_jsonl(run_dir.join(AUDIT_FILE).as_path(), &audit_events)?;
    artifacts.write_config_snapshot_toml(run_dir.join(CONFIG_FILE).as_path(), config_toml)?;

    Ok(run_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    const BASE: &str = r#"
[run]
run_id = "shared"
symbol = "BTC_USDT"
timeframe = "1h"
initial_capital = 1000.0
seed = 7

[data]
ohlcv_path = "bars.csv"
out_dir = "runs"

[costs]
fee_bps = 5.0
slippage_bps = 1.0

[risk]
max_leverage = 2.0
max_position_pct = 0.5
daily_loss_limit_pct = 0.05
max_drawdown_pct = 0.2
"#;

    #[test]
    fn execution_config_uses_taker_fee_for_maker_by_default() {
        let config = parse_config(BASE).expect("config");
        let execution = resolve_execution_config(&config).expect("execution");
        assert_eq!(execution.maker_fee_bps, 5.0);
        assert_eq!(execution.taker_fee_bps, 5.0);
        assert_eq!(execution.bar_seconds, 3600);
        assert_eq!(execution.seed, 7);
        assert_eq!(execution.remainder, RemainderPolicy::Carry);
    }

    #[test]
    fn sharpe_is_annualized_from_the_timeframe_by_default() {
        let config = parse_config(BASE).expect("config");
        assert_eq!(build_metrics_config(&config).annualization_factor, Some(8_760.0));

        let explicit = parse_config(&format!(
            "{BASE}\n[metrics]\nannualization_factor = 252.0\n"
        ))
        .expect("config");
        let metrics = build_metrics_config(&explicit);
        assert_eq!(metrics.annualization_factor, Some(252.0));
        assert_eq!(metrics.risk_free_rate, 0.0);
    }

    #[test]
    fn execution_config_rejects_unknown_remainder() {
        let raw = format!("{BASE}\n[execution]\nremainder = \"keep\"\n");
        let config = parse_config(&raw).expect("config");
        let err = resolve_execution_config(&config).expect_err("bad remainder");
        assert!(err.contains("execution.remainder"), "{err}");
    }

    #[test]
    fn size_and_margin_modes_parse() {
        let raw = format!("{BASE}\n[orders]\nsize_mode = \"pct_equity\"\nmargin_mode = \"cross\"\n");
        let config = parse_config(&raw).expect("config");
        assert_eq!(resolve_size_mode(&config), Ok(OrderSizeMode::PctEquity));
        assert_eq!(resolve_margin_mode(&config), Ok(MarginMode::Cross));

        let raw = format!("{BASE}\n[orders]\nsize_mode = \"lots\"\n");
        let config = parse_config(&raw).expect("config");
        assert!(resolve_size_mode(&config).is_err());
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let point = EquityPoint {
            timestamp: 60,
            equity: 1000.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            fees: 0.0,
            funding: 0.0,
            drawdown: 0.0,
            cumulative_return: 0.0,
            open_positions: 0,
        };
        let a = run_fingerprint(&[], std::slice::from_ref(&point)).expect("hash");
        let b = run_fingerprint(&[], std::slice::from_ref(&point)).expect("hash");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let moved = EquityPoint {
            equity: 1000.5,
            ..point
        };
        let c = run_fingerprint(&[], &[moved]).expect("hash");
        assert_ne!(a, c);
    }

    #[test]
    fn describe_run_error_reports_cancellation() {
        let msg = describe_run_error("paper", BacktestRunError::Cancelled { bars_processed: 3 });
        assert_eq!(msg, "paper run cancelled after 3 bars");
    }
}
