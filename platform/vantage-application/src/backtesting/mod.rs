use crate::config::Config;
use crate::shared::{
    build_settings, build_strategy, describe_run_error, load_catalog, record_run_metrics,
    resolve_execution_config, resolve_timeframe, timing_event, write_outputs,
};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info_span;
use vantage_domain::repositories::artifacts::ArtifactWriter;
use vantage_domain::repositories::catalog::CatalogRepository;
use vantage_domain::repositories::market_data::{MarketDataRepository, OhlcvQuery};
use vantage_domain::services::audit::AuditEvent;
use vantage_domain::services::engine::backtest::{
    BacktestRunner, BarProgress, NoopControl, RunControl,
};
use vantage_domain::services::market_data_source::VecBarSource;

pub fn run_backtest(
    config: &Config,
    config_toml: &str,
    out: Option<PathBuf>,
    market_data: &dyn MarketDataRepository,
    catalog_repo: &dyn CatalogRepository,
    artifacts: &dyn ArtifactWriter,
) -> Result<PathBuf, String> {
    run_backtest_with_progress_control(
        config,
        config_toml,
        out,
        market_data,
        catalog_repo,
        artifacts,
        &mut |_progress: BarProgress| {},
        &NoopControl,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn run_backtest_with_progress_control(
    config: &Config,
    config_toml: &str,
    out: Option<PathBuf>,
    market_data: &dyn MarketDataRepository,
    catalog_repo: &dyn CatalogRepository,
    artifacts: &dyn ArtifactWriter,
    progress: &mut dyn FnMut(BarProgress),
    control: &dyn RunControl,
) -> Result<PathBuf, String> {
    let _span = info_span!(
        "run_backtest",
        run_id = %config.run.run_id,
        symbol = %config.run.symbol,
        timeframe = %config.run.timeframe
    )
    .entered();

    let mut audit_extras: Vec<AuditEvent> = Vec::new();
    let timeframe = resolve_timeframe(config)?;
    let execution = resolve_execution_config(config)?;
    let settings = build_settings(config, &execution)?;

    let stage_start = Instant::now();
    let (bars, report) = market_data.load_ohlcv(&OhlcvQuery {
        source: PathBuf::from(&config.data.ohlcv_path),
        symbol: Some(config.run.symbol.clone()),
        expected_step_seconds: Some(timeframe.step_seconds),
    })?;
    let load_ms = stage_start.elapsed().as_millis() as u64;
    metrics::histogram!("vantage.backtest.load_ohlcv_ms").record(load_ms as f64);
    if bars.is_empty() {
        return Err(format!(
            "no OHLCV rows for {} in {}",
            config.run.symbol, config.data.ohlcv_path
        ));
    }
    if report.has_fatal_issues() {
        tracing::warn!(
            duplicates = report.duplicates,
            out_of_order = report.out_of_order,
            invalid_bars = report.invalid_bars,
            "OHLCV data has ordering or sanity issues; the run will abort at the first one"
        );
    }
    let first_ts = bars.first().map(|bar| bar.timestamp).unwrap_or(0);
    audit_extras.push(timing_event(
        &config.run.run_id,
        first_ts,
        Some(&config.run.symbol),
        "load_ohlcv",
        load_ms,
        serde_json::json!({
            "rows": report.rows,
            "gaps": report.gaps,
            "duplicates": report.duplicates,
            "out_of_order": report.out_of_order,
            "invalid_bars": report.invalid_bars,
        }),
    ));

    let stage_start = Instant::now();
    let catalog = load_catalog(config, catalog_repo)?;
    let catalog_ms = stage_start.elapsed().as_millis() as u64;
    audit_extras.push(timing_event(
        &config.run.run_id,
        first_ts,
        None,
        "load_catalog",
        catalog_ms,
        serde_json::json!({ "markets": catalog.len() }),
    ));

    let stage_start = Instant::now();
    let mut runner = BacktestRunner::new(
        settings,
        build_strategy(config),
        VecBarSource::new(bars),
        catalog,
    );
    let results = runner
        .run_with_progress_control(progress, control)
        .map_err(|err| describe_run_error("backtest", err))?;
    let engine_ms = stage_start.elapsed().as_millis() as f64;
    record_run_metrics("backtest", &results, engine_ms);
    let last_ts = results.equity.last().map(|p| p.timestamp).unwrap_or(first_ts);
    audit_extras.push(timing_event(
        &config.run.run_id,
        last_ts,
        Some(&config.run.symbol),
        "engine",
        engine_ms as u64,
        serde_json::json!({
            "bars_processed": results.summary.bars_processed,
            "trades": results.summary.trades,
        }),
    ));

    let run_dir = write_outputs(
        config,
        config_toml,
        out,
        "backtest",
        results,
        &execution,
        artifacts,
        audit_extras,
    )?;
    tracing::info!(run_dir = %run_dir.display(), "backtest artifacts written");
    Ok(run_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use std::cell::Cell;
    use std::path::Path;
    use vantage_domain::entities::catalog::{MarketCatalog, MarketSpec};
    use vantage_domain::repositories::artifacts::ArtifactReader;
    use vantage_domain::services::ohlcv::{data_quality_from_bars, DataQualityReport};
    use vantage_domain::value_objects::bar::Bar;
    use vantage_infrastructure::artifacts::{FilesystemArtifactReader, FilesystemArtifactWriter};

    struct InMemoryMarketData {
        bars: Vec<Bar>,
    }

    impl MarketDataRepository for InMemoryMarketData {
        fn load_ohlcv(&self, query: &OhlcvQuery) -> Result<(Vec<Bar>, DataQualityReport), String> {
            let bars: Vec<Bar> = self
                .bars
                .iter()
                .filter(|bar| query.symbol.as_deref().map_or(true, |s| s == bar.symbol))
                .cloned()
                .collect();
            let report = data_quality_from_bars(&bars, query.expected_step_seconds);
            Ok((bars, report))
        }
    }

    struct StaticCatalog(MarketCatalog);

    impl CatalogRepository for StaticCatalog {
        fn load_catalog(&self, _path: &Path) -> Result<MarketCatalog, String> {
            Ok(self.0.clone())
        }
    }

    struct CancelAfter {
        polls: Cell<usize>,
        limit: usize,
    }

    impl RunControl for CancelAfter {
        fn should_cancel(&self) -> bool {
            let polls = self.polls.get() + 1;
            self.polls.set(polls);
            polls > self.limit
        }

        fn wait_if_paused(&self) -> bool {
            true
        }
    }

    fn test_temp_dir(prefix: &str) -> PathBuf {
        let unique = format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock before UNIX_EPOCH")
                .as_nanos()
        );
        std::env::temp_dir().join(unique)
    }

    fn sample_bars(count: usize) -> Vec<Bar> {
        (0..count)
            .map(|index| {
                let close = 100.0 + (index % 7) as f64 - (index % 3) as f64;
                Bar {
                    symbol: "BTC_USDT".to_string(),
                    timestamp: 60 * (index as i64 + 1),
                    open: close,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 50.0,
                }
            })
            .collect()
    }

    fn config_for(out_dir: &Path, seed: u64) -> (Config, String) {
        let raw = format!(
            r#"
[run]
run_id = "bt_demo"
symbol = "BTC_USDT"
timeframe = "1m"
initial_capital = 1000.0
seed = {seed}

[data]
ohlcv_path = "unused.csv"
catalog_path = "catalog.json"
out_dir = "{}"

[costs]
fee_bps = 10.0
slippage_bps = 2.0
slippage_jitter_bps = 3.0

[risk]
max_leverage = 3.0
max_position_pct = 0.0
daily_loss_limit_pct = 0.0
max_drawdown_pct = 0.0

[strategy]
kind = "sma_cross"
short_window = 2
long_window = 4
size = 1.0
leverage = 2.0
allow_short = true
"#,
            out_dir.display()
        );
        (parse_config(&raw).expect("config"), raw)
    }

    #[test]
    fn run_backtest_writes_artifacts_with_fingerprint() {
        let temp_dir = test_temp_dir("vantage_backtest_artifacts");
        let (config, raw) = config_for(&temp_dir, 11);
        let market = InMemoryMarketData {
            bars: sample_bars(40),
        };
        let catalog = StaticCatalog(MarketCatalog::new(vec![MarketSpec::unrestricted(
            "BTC_USDT", 5.0,
        )]));
        let writer = FilesystemArtifactWriter::new();

        let run_dir =
            run_backtest(&config, &raw, None, &market, &catalog, &writer).expect("backtest");
        assert_eq!(run_dir, temp_dir.join("bt_demo"));
        for file in [
            "trades.csv",
            "fills.csv",
            "equity.csv",
            "summary.json",
            "audit.jsonl",
            "config.toml",
        ] {
            assert!(run_dir.join(file).exists(), "missing {file}");
        }

        let reader = FilesystemArtifactReader::new();
        let summary = reader
            .read_summary_json(run_dir.join("summary.json").as_path())
            .expect("summary");
        assert_eq!(summary["meta"]["mode"], "backtest");
        assert_eq!(summary["summary"]["bars_processed"], 40);
        let fingerprint = summary["meta"]["fingerprint"]["trades_equity"]
            .as_str()
            .expect("fingerprint");
        assert_eq!(fingerprint.len(), 64);

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn identical_seeds_produce_identical_fingerprints() {
        let temp_dir = test_temp_dir("vantage_backtest_seeds");
        let market = InMemoryMarketData {
            bars: sample_bars(60),
        };
        let catalog = StaticCatalog(MarketCatalog::default());
        let writer = FilesystemArtifactWriter::new();
        let reader = FilesystemArtifactReader::new();

        let mut fingerprints = Vec::new();
        for (idx, seed) in [5_u64, 5, 6].into_iter().enumerate() {
            let (config, raw) = config_for(&temp_dir.join(idx.to_string()), seed);
            let run_dir =
                run_backtest(&config, &raw, None, &market, &catalog, &writer).expect("backtest");
            let summary = reader
                .read_summary_json(run_dir.join("summary.json").as_path())
                .expect("summary");
            fingerprints.push(summary["meta"]["fingerprint"]["trades_equity"].clone());
        }
        assert_eq!(fingerprints[0], fingerprints[1]);
        assert_ne!(fingerprints[0], fingerprints[2]);

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn cancelled_backtest_writes_nothing() {
        let temp_dir = test_temp_dir("vantage_backtest_cancel");
        let (config, raw) = config_for(&temp_dir, 1);
        let market = InMemoryMarketData {
            bars: sample_bars(20),
        };
        let catalog = StaticCatalog(MarketCatalog::default());
        let writer = FilesystemArtifactWriter::new();
        let control = CancelAfter {
            polls: Cell::new(0),
            limit: 5,
        };

        let err = run_backtest_with_progress_control(
            &config,
            &raw,
            None,
            &market,
            &catalog,
            &writer,
            &mut |_progress: BarProgress| {},
            &control,
        )
        .expect_err("cancelled");
        assert_eq!(err, "backtest run cancelled after 5 bars");
        assert!(!temp_dir.join("bt_demo").exists());
    }

    #[test]
    fn out_of_order_data_aborts_with_diagnostics() {
        let temp_dir = test_temp_dir("vantage_backtest_abort");
        let (config, raw) = config_for(&temp_dir, 1);
        let mut bars = sample_bars(10);
        bars.swap(6, 7);
        let market = InMemoryMarketData { bars };
        let catalog = StaticCatalog(MarketCatalog::default());
        let writer = FilesystemArtifactWriter::new();

        let err = run_backtest(&config, &raw, None, &market, &catalog, &writer)
            .expect_err("invariant");
        assert!(err.starts_with("backtest run aborted"), "{err}");
        assert!(err.contains("\"bars_processed\":7"), "{err}");
        assert!(err.contains("\"timestamp\":420"), "{err}");
    }

    #[test]
    fn empty_data_is_rejected() {
        let temp_dir = test_temp_dir("vantage_backtest_empty");
        let (config, raw) = config_for(&temp_dir, 1);
        let market = InMemoryMarketData { bars: Vec::new() };
        let catalog = StaticCatalog(MarketCatalog::default());
        let writer = FilesystemArtifactWriter::new();
        let err = run_backtest(&config, &raw, None, &market, &catalog, &writer)
            .expect_err("empty");
        assert!(err.contains("no OHLCV rows"), "{err}");
    }
}
