use crate::config::Config;
use crate::shared::{
    build_settings, build_strategy, describe_run_error, load_catalog, record_run_metrics,
    resolve_execution_config, resolve_timeframe, timing_event, write_outputs,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info_span;
use vantage_domain::repositories::artifacts::ArtifactWriter;
use vantage_domain::repositories::catalog::CatalogRepository;
use vantage_domain::repositories::market_data::{MarketDataRepository, OhlcvQuery};
use vantage_domain::services::engine::backtest::{BacktestRunner, BarProgress, RunControl};
use vantage_domain::services::market_data_source::MarketDataSource;
use vantage_domain::value_objects::bar::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperSource {
    /// Paces the configured CSV bars in (scaled) real time.
    Replay,
    /// Closed candles polled from the exchange gateway.
    Poll,
}

pub fn resolve_paper_source(config: &Config) -> Result<PaperSource, String> {
    match config
        .paper
        .as_ref()
        .and_then(|paper| paper.source.as_deref())
        .map(|s| s.trim().to_lowercase())
        .as_deref()
    {
        None | Some("replay") => Ok(PaperSource::Replay),
        Some("poll") => Ok(PaperSource::Poll),
        Some(other) => Err(format!("paper.source must be: replay|poll (got {other})")),
    }
}

/// Cancellation shared with a signal handler or another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl RunControl for CancelFlag {
    fn should_cancel(&self) -> bool {
        self.is_cancelled()
    }
}

/// Feeds stored bars at the pace of the timeframe divided by `replay_scale` (0 disables pacing).
pub struct ReplayBarSource {
    bars: std::vec::IntoIter<Bar>,
    interval: Duration,
    last_tick: Option<Instant>,
}

impl ReplayBarSource {
    pub fn new(bars: Vec<Bar>, step_seconds: i64, replay_scale: u64) -> Self {
        let interval = if replay_scale == 0 || step_seconds <= 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(step_seconds as f64 / replay_scale as f64)
        };
        Self {
            bars: bars.into_iter(),
            interval,
            last_tick: None,
        }
    }
}

impl MarketDataSource for ReplayBarSource {
    fn next_bar(&mut self) -> Option<Bar> {
        let bar = self.bars.next()?;
        if !self.interval.is_zero() {
            if let Some(last) = self.last_tick {
                let elapsed = last.elapsed();
                if elapsed < self.interval {
                    thread::sleep(self.interval - elapsed);
                }
            }
            self.last_tick = Some(Instant::now());
        }
        Some(bar)
    }
}

/// Stops the wrapped source after `max_bars` bars.
pub struct BoundedSource<D> {
    inner: D,
    remaining: Option<u64>,
}

impl<D: MarketDataSource> BoundedSource<D> {
    pub fn new(inner: D, max_bars: Option<u64>) -> Self {
        Self {
            inner,
            remaining: max_bars,
        }
    }
}

impl<D: MarketDataSource> MarketDataSource for BoundedSource<D> {
    fn next_bar(&mut self) -> Option<Bar> {
        match self.remaining.as_mut() {
            Some(0) => None,
            Some(remaining) => {
                *remaining -= 1;
                self.inner.next_bar()
            }
            None => self.inner.next_bar(),
        }
    }
}

/// Loads the configured CSV bars for a paced paper replay.
pub fn replay_source(
    config: &Config,
    market_data: &dyn MarketDataRepository,
) -> Result<ReplayBarSource, String> {
    let timeframe = resolve_timeframe(config)?;
    let (bars, _report) = market_data.load_ohlcv(&OhlcvQuery {
        source: PathBuf::from(&config.data.ohlcv_path),
        symbol: Some(config.run.symbol.clone()),
        expected_step_seconds: Some(timeframe.step_seconds),
    })?;
    let replay_scale = config
        .paper
        .as_ref()
        .and_then(|paper| paper.replay_scale)
        .unwrap_or(0);
    Ok(ReplayBarSource::new(
        bars,
        timeframe.step_seconds,
        replay_scale,
    ))
}

/// Runs the backtest engine against a live or paced bar source and writes the same artifacts
/// as a backtest. Cancelled runs write nothing.
#[allow(clippy::too_many_arguments)]
pub fn run_paper<D: MarketDataSource>(
    config: &Config,
    config_toml: &str,
    out: Option<PathBuf>,
    data: D,
    catalog_repo: &dyn CatalogRepository,
    artifacts: &dyn ArtifactWriter,
    control: &dyn RunControl,
    progress: &mut dyn FnMut(BarProgress),
) -> Result<PathBuf, String> {
    let _span = info_span!(
        "run_paper",
        run_id = %config.run.run_id,
        symbol = %config.run.symbol,
        timeframe = %config.run.timeframe
    )
    .entered();

    let execution = resolve_execution_config(config)?;
    let settings = build_settings(config, &execution)?;
    let catalog = load_catalog(config, catalog_repo)?;
    let max_bars = config.paper.as_ref().and_then(|paper| paper.max_bars);

    let stage_start = Instant::now();
    let mut runner = BacktestRunner::new(
        settings,
        build_strategy(config),
        BoundedSource::new(data, max_bars),
        catalog,
    );
    let results = runner
        .run_with_progress_control(progress, control)
        .map_err(|err| describe_run_error("paper", err))?;
    let engine_ms = stage_start.elapsed().as_millis() as f64;
    record_run_metrics("paper", &results, engine_ms);

    let last_ts = results.equity.last().map(|p| p.timestamp).unwrap_or(0);
    let audit_extras = vec![timing_event(
        &config.run.run_id,
        last_ts,
        Some(&config.run.symbol),
        "engine",
        engine_ms as u64,
        serde_json::json!({
            "bars_processed": results.summary.bars_processed,
            "trades": results.summary.trades,
            "max_bars": max_bars,
        }),
    )];

    let run_dir = write_outputs(
        config,
        config_toml,
        out,
        "paper",
        results,
        &execution,
        artifacts,
        audit_extras,
    )?;
    tracing::info!(run_dir = %run_dir.display(), "paper artifacts written");
    Ok(run_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use std::path::Path;
    use std::sync::mpsc;
    use vantage_domain::entities::catalog::MarketCatalog;
    use vantage_domain::repositories::artifacts::ArtifactReader;
    use vantage_domain::services::market_data_source::{ChannelBarSource, VecBarSource};
    use vantage_domain::services::ohlcv::{data_quality_from_bars, DataQualityReport};
    use vantage_infrastructure::artifacts::{FilesystemArtifactReader, FilesystemArtifactWriter};

    struct EmptyCatalog;

    impl CatalogRepository for EmptyCatalog {
        fn load_catalog(&self, _path: &Path) -> Result<MarketCatalog, String> {
            Ok(MarketCatalog::default())
        }
    }

    struct InMemoryMarketData(Vec<Bar>);

    impl MarketDataRepository for InMemoryMarketData {
        fn load_ohlcv(&self, query: &OhlcvQuery) -> Result<(Vec<Bar>, DataQualityReport), String> {
            Ok((
                self.0.clone(),
                data_quality_from_bars(&self.0, query.expected_step_seconds),
            ))
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

    fn bars(count: usize) -> Vec<Bar> {
        (0..count)
            .map(|index| {
                let close = 200.0 + ((index * 5) % 11) as f64;
                Bar {
                    symbol: "ETH_USDT".to_string(),
                    timestamp: 60 * (index as i64 + 1),
                    open: close,
                    high: close + 2.0,
                    low: close - 2.0,
                    close,
                    volume: 10.0,
                }
            })
            .collect()
    }

    fn config(out_dir: &Path, run_id: &str, extra: &str) -> (Config, String) {
        let raw = format!(
            r#"
[run]
run_id = "{run_id}"
symbol = "ETH_USDT"
timeframe = "1m"
initial_capital = 5000.0
seed = 3

[data]
ohlcv_path = "unused.csv"
out_dir = "{}"

[costs]
fee_bps = 4.0
slippage_bps = 1.0

[risk]
max_leverage = 5.0
max_position_pct = 0.0
daily_loss_limit_pct = 0.0
max_drawdown_pct = 0.0

[strategy]
kind = "sma_cross"
short_window = 2
long_window = 3
size = 2.0
leverage = 3.0
allow_short = true
{extra}
"#,
            out_dir.display()
        );
        (parse_config(&raw).expect("config"), raw)
    }

    fn fingerprint(run_dir: &Path) -> serde_json::Value {
        let summary = FilesystemArtifactReader::new()
            .read_summary_json(run_dir.join("summary.json").as_path())
            .expect("summary");
        summary["meta"]["fingerprint"]["trades_equity"].clone()
    }

    #[test]
    fn paper_over_channel_matches_backtest_engine() {
        let temp_dir = test_temp_dir("vantage_paper_parity");
        let writer = FilesystemArtifactWriter::new();
        let (paper_config, paper_raw) = config(&temp_dir, "paper", "");
        let (bt_config, bt_raw) = config(&temp_dir, "backtest", "");

        let (tx, rx) = mpsc::channel();
        let feed = thread::spawn(move || {
            for bar in bars(30) {
                tx.send(bar).expect("send");
            }
        });
        let paper_dir = run_paper(
            &paper_config,
            &paper_raw,
            None,
            ChannelBarSource::new(rx),
            &EmptyCatalog,
            &writer,
            &CancelFlag::new(),
            &mut |_progress: BarProgress| {},
        )
        .expect("paper");
        feed.join().expect("feed thread");

        let backtest_dir = crate::backtesting::run_backtest(
            &bt_config,
            &bt_raw,
            None,
            &InMemoryMarketData(bars(30)),
            &EmptyCatalog,
            &writer,
        )
        .expect("backtest");

        assert_eq!(fingerprint(&paper_dir), fingerprint(&backtest_dir));
        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn paper_stops_after_max_bars() {
        let temp_dir = test_temp_dir("vantage_paper_bounded");
        let (config, raw) = config(&temp_dir, "bounded", "\n[paper]\nmax_bars = 12\n");
        let run_dir = run_paper(
            &config,
            &raw,
            None,
            VecBarSource::new(bars(30)),
            &EmptyCatalog,
            &FilesystemArtifactWriter::new(),
            &CancelFlag::new(),
            &mut |_progress: BarProgress| {},
        )
        .expect("paper");
        let equity = FilesystemArtifactReader::new()
            .read_equity_csv(run_dir.join("equity.csv").as_path())
            .expect("equity");
        assert_eq!(equity.len(), 12);
        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn cancelled_paper_run_reports_progress_and_writes_nothing() {
        let temp_dir = test_temp_dir("vantage_paper_cancel");
        let (config, raw) = config(&temp_dir, "cancel", "");
        let flag = CancelFlag::new();
        let trigger = flag.clone();
        let mut seen = 0;
        let err = run_paper(
            &config,
            &raw,
            None,
            VecBarSource::new(bars(30)),
            &EmptyCatalog,
            &FilesystemArtifactWriter::new(),
            &flag,
            &mut |progress: BarProgress| {
                seen += 1;
                if progress.bar_index == 4 {
                    trigger.cancel();
                }
            },
        )
        .expect_err("cancelled");
        assert_eq!(err, "paper run cancelled after 5 bars");
        assert_eq!(seen, 5);
        assert!(!temp_dir.join("cancel").exists());
    }

    #[test]
    fn replay_source_without_scale_does_not_sleep() {
        let mut source = ReplayBarSource::new(bars(3), 3600, 0);
        let start = Instant::now();
        let mut count = 0;
        while source.next_bar().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn paper_source_is_validated() {
        let temp_dir = test_temp_dir("vantage_paper_source");
        let (config, _) = config(&temp_dir, "src", "\n[paper]\nsource = \"poll\"\n");
        assert_eq!(resolve_paper_source(&config), Ok(PaperSource::Poll));
        let (config, _) = config_with_source(&temp_dir, "stream");
        assert!(resolve_paper_source(&config).is_err());
    }

    fn config_with_source(out_dir: &Path, source: &str) -> (Config, String) {
        config(
            out_dir,
            "src",
            &format!("\n[paper]\nsource = \"{source}\"\n"),
        )
    }
}
