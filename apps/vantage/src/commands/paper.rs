use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use vantage_application::config::{load_config_with_source, Config};
use vantage_application::paper_trading::{
    replay_source, resolve_paper_source, run_paper as run_paper_engine, CancelFlag, PaperSource,
};
use vantage_domain::services::engine::backtest::BarProgress;
use vantage_domain::services::market_data_source::ChannelBarSource;
use vantage_domain::value_objects::timeframe::Timeframe;
use vantage_infrastructure::exchange::feed::CandlePoller;
use vantage_infrastructure::exchange::retry::CancelToken;

const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

pub(super) fn run_paper(config_path: PathBuf, out: Option<PathBuf>) -> Result<(), String> {
    let (config, config_toml) = load_config_with_source(&config_path)?;
    super::common::print_config_summary("paper", &config, out.as_ref());

    let source = resolve_paper_source(&config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|err| format!("failed to start async runtime: {err}"))?;

    let run_dir = match source {
        PaperSource::Replay => run_replay(&runtime, &config, &config_toml, out)?,
        PaperSource::Poll => run_poll(&runtime, &config, &config_toml, out)?,
    };
    println!("run output: {}", run_dir.display());
    Ok(())
}

fn log_bar(progress: BarProgress) {
    tracing::info!(
        bar = progress.bar_index,
        ts = progress.timestamp,
        close = progress.close,
        equity = progress.equity,
        trades = progress.trades_in_bar,
        "paper bar"
    );
}

/// Ctrl-C cancels the engine; a cancelled replay writes no artifacts.
fn run_replay(
    runtime: &tokio::runtime::Runtime,
    config: &Config,
    config_toml: &str,
    out: Option<PathBuf>,
) -> Result<PathBuf, String> {
    let deps = crate::infra::build_engine_deps();
    let bars = replay_source(config, deps.market_data.as_ref())?;

    let control = CancelFlag::new();
    let on_signal = control.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling paper replay");
            on_signal.cancel();
        }
    });

    run_paper_engine(
        config,
        config_toml,
        out,
        bars,
        deps.catalog.as_ref(),
        deps.artifacts.as_ref(),
        &control,
        &mut log_bar,
    )
}

/// Ctrl-C stops the candle feed; the engine then drains what it has and writes its artifacts.
fn run_poll(
    runtime: &tokio::runtime::Runtime,
    config: &Config,
    config_toml: &str,
    out: Option<PathBuf>,
) -> Result<PathBuf, String> {
    let deps = crate::infra::build_engine_deps();
    let exchange = crate::infra::build_exchange_deps(config)?;
    let timeframe = Timeframe::parse(&config.run.timeframe)?;
    let poll_interval = Duration::from_millis(
        config
            .paper
            .as_ref()
            .and_then(|paper| paper.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
    );

    let mut poller = CandlePoller::new(
        exchange.gateway,
        exchange.client,
        &config.run.symbol,
        &timeframe,
        poll_interval,
    );
    if let Some(deadline) = exchange.call_deadline {
        poller = poller.with_call_timeout(deadline);
    }

    let (tx, rx) = mpsc::channel();
    let cancel = CancelToken::new();
    let feed = runtime.spawn(poller.run(tx, cancel.clone()));
    let on_signal = cancel.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping candle feed");
            on_signal.cancel();
        }
    });

    let control = CancelFlag::new();
    let result = run_paper_engine(
        config,
        config_toml,
        out,
        ChannelBarSource::new(rx),
        deps.catalog.as_ref(),
        deps.artifacts.as_ref(),
        &control,
        &mut log_bar,
    );
    cancel.cancel();

    let feed_result = runtime
        .block_on(feed)
        .map_err(|err| format!("candle feed task failed: {err}"))?;
    let run_dir = result?;
    match feed_result {
        Ok(bars) => {
            tracing::info!(bars, "candle feed stopped");
            Ok(run_dir)
        }
        Err(err) => Err(format!(
            "candle feed failed ({}); partial run written to {}",
            err,
            run_dir.display()
        )),
    }
}
