use crate::config::Config;
use crate::shared::resolve_timeframe;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info_span;
use vantage_domain::repositories::market_data::{MarketDataRepository, OhlcvQuery};
use vantage_domain::services::ohlcv::DataQualityReport;

/// Loads the configured OHLCV file and reports its data quality. In strict mode any count above
/// its `[data_quality]` limit (default 0) fails the validation.
pub fn validate(
    config: &Config,
    strict: bool,
    market_data: &dyn MarketDataRepository,
) -> Result<serde_json::Value, String> {
    let _span = info_span!(
        "validate",
        strict = strict,
        run_id = %config.run.run_id,
        symbol = %config.run.symbol,
        timeframe = %config.run.timeframe
    )
    .entered();

    let stage_start = Instant::now();
    let timeframe = resolve_timeframe(config)?;
    let (_bars, report) = market_data.load_ohlcv(&OhlcvQuery {
        source: PathBuf::from(&config.data.ohlcv_path),
        symbol: Some(config.run.symbol.clone()),
        expected_step_seconds: Some(timeframe.step_seconds),
    })?;
    metrics::histogram!("vantage.validate.load_ohlcv_ms")
        .record(stage_start.elapsed().as_millis() as f64);

    let limits = config.data_quality.as_ref();
    let max_gaps = limits.and_then(|l| l.max_gaps).unwrap_or(0);
    let max_duplicates = limits.and_then(|l| l.max_duplicates).unwrap_or(0);
    let max_out_of_order = limits.and_then(|l| l.max_out_of_order).unwrap_or(0);
    let max_invalid_bars = limits.and_then(|l| l.max_invalid_bars).unwrap_or(0);
    let max_zero_volume = limits.and_then(|l| l.max_zero_volume).unwrap_or(0);

    metrics::gauge!("vantage.validate.ohlcv.gaps").set(report.gaps as f64);
    metrics::gauge!("vantage.validate.ohlcv.duplicates").set(report.duplicates as f64);
    metrics::gauge!("vantage.validate.ohlcv.out_of_order").set(report.out_of_order as f64);
    metrics::gauge!("vantage.validate.ohlcv.invalid_bars").set(report.invalid_bars as f64);
    metrics::gauge!("vantage.validate.ohlcv.zero_volume").set(report.zero_volume as f64);

    let mut exceeded = Vec::new();
    for (name, value, limit) in [
        ("gaps", report.gaps, max_gaps),
        ("duplicates", report.duplicates, max_duplicates),
        ("out_of_order", report.out_of_order, max_out_of_order),
        ("invalid_bars", report.invalid_bars, max_invalid_bars),
        ("zero_volume", report.zero_volume, max_zero_volume),
    ] {
        if value > limit {
            exceeded.push(format!("{name}={value} (max {limit})"));
        }
    }
    if report.rows == 0 {
        exceeded.push("rows=0".to_string());
    }

    if strict && !exceeded.is_empty() {
        return Err(format!(
            "strict validation failed: data quality limits exceeded: {}",
            exceeded.join(", ")
        ));
    }
    if !exceeded.is_empty() {
        tracing::warn!(exceeded = %exceeded.join(", "), "data quality limits exceeded");
    }

    Ok(serde_json::json!({
        "source": config.data.ohlcv_path,
        "symbol": config.run.symbol,
        "timeframe": timeframe.label,
        "step_seconds": timeframe.step_seconds,
        "ohlcv": data_quality_json(&report),
        "replayable": !report.has_fatal_issues(),
        "limits": {
            "max_gaps": max_gaps,
            "max_duplicates": max_duplicates,
            "max_out_of_order": max_out_of_order,
            "max_invalid_bars": max_invalid_bars,
            "max_zero_volume": max_zero_volume,
        },
        "exceeded": exceeded,
        "strict": strict
    }))
}

fn data_quality_json(report: &DataQualityReport) -> serde_json::Value {
    serde_json::json!({
        "rows": report.rows,
        "symbols": report.symbols,
        "duplicates": report.duplicates,
        "gaps": report.gaps,
        "out_of_order": report.out_of_order,
        "invalid_bars": report.invalid_bars,
        "zero_volume": report.zero_volume,
        "first_timestamp": report.first_timestamp,
        "last_timestamp": report.last_timestamp,
        "first_gap": report.first_gap,
        "first_duplicate": report.first_duplicate,
        "first_out_of_order": report.first_out_of_order,
        "first_invalid": report.first_invalid,
        "max_gap_seconds": report.max_gap_seconds,
    })
}
