use std::path::PathBuf;
use vantage_application::config::load_config_with_source;

pub(super) fn run_backtest(config_path: PathBuf, out: Option<PathBuf>) -> Result<(), String> {
    let (config, config_toml) = load_config_with_source(&config_path)?;
    super::common::print_config_summary("backtest", &config, out.as_ref());

    let deps = crate::infra::build_engine_deps();
    let run_dir = vantage_application::backtesting::run_backtest(
        &config,
        &config_toml,
        out,
        deps.market_data.as_ref(),
        deps.catalog.as_ref(),
        deps.artifacts.as_ref(),
    )?;
    println!("run output: {}", run_dir.display());
    Ok(())
}
