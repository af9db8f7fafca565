use std::path::PathBuf;
use vantage_application::config::Config;

pub(super) fn print_config_summary(command: &str, config: &Config, out: Option<&PathBuf>) {
    println!(
        "vantage cli: {} (run_id={}, symbol={}, timeframe={}, initial_capital={})",
        command,
        config.run.run_id,
        config.run.symbol,
        config.run.timeframe,
        config.run.initial_capital
    );
    println!(
        "data: ohlcv_path={}, catalog_path={}, out_dir={}",
        config.data.ohlcv_path,
        config.data.catalog_path.as_deref().unwrap_or("none"),
        out.map(|path| path.display().to_string())
            .unwrap_or_else(|| config.data.out_dir.clone())
    );
    println!(
        "costs: fee_bps={}, maker_fee_bps={}, slippage_bps={}",
        config.costs.fee_bps,
        config
            .costs
            .maker_fee_bps
            .map(|bps| bps.to_string())
            .unwrap_or_else(|| "taker".to_string()),
        config.costs.slippage_bps
    );
    println!(
        "risk: max_leverage={}, max_position_pct={}, daily_loss_limit_pct={}, max_drawdown_pct={}",
        config.risk.max_leverage,
        config.risk.max_position_pct,
        config.risk.daily_loss_limit_pct,
        config.risk.max_drawdown_pct
    );
    let orders = config.orders.as_ref();
    println!(
        "orders: size_mode={}, margin_mode={}",
        orders
            .and_then(|o| o.size_mode.as_deref())
            .unwrap_or("qty"),
        orders
            .and_then(|o| o.margin_mode.as_deref())
            .unwrap_or("isolated")
    );
    println!(
        "strategy: {}",
        config
            .strategy
            .as_ref()
            .map(|strategy| strategy.kind())
            .unwrap_or("hold")
    );
}
