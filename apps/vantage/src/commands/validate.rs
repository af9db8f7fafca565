use std::path::PathBuf;
use vantage_application::config::load_config;

pub(super) fn run_validate(config_path: PathBuf, strict: bool) -> Result<(), String> {
    let config = load_config(&config_path)?;
    super::common::print_config_summary("validate", &config, None);

    let market_data = crate::infra::build_market_data_repo();
    let report = vantage_application::validation::validate(&config, strict, market_data.as_ref())?;
    let pretty = serde_json::to_string_pretty(&report)
        .map_err(|err| format!("failed to render validation report: {err}"))?;
    println!("{pretty}");
    Ok(())
}
