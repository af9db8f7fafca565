use crate::config::{parse_config, Config};
use crate::shared::{resolve_timeframe, to_hex, SUMMARY_FILE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use tracing::info_span;
use vantage_domain::entities::metrics::MetricsSummary;
use vantage_domain::repositories::artifacts::{ArtifactWriter, LeaderboardRow};
use vantage_domain::repositories::catalog::CatalogRepository;
use vantage_domain::repositories::market_data::{MarketDataRepository, OhlcvQuery};
use vantage_domain::services::ohlcv::{data_quality_from_bars, DataQualityReport};
use vantage_domain::value_objects::bar::Bar;

/// Dotted paths a sweep may not override: every run must replay the same data into its own
/// directory under the sweep.
const FORBIDDEN_PREFIXES: [&str; 4] = ["run.symbol", "run.timeframe", "run.run_id", "data."];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SweepFile {
    pub base: SweepBase,
    pub sweep: SweepMeta,
    #[serde(default)]
    pub params: Vec<SweepParam>,
    pub leaderboard: Option<LeaderboardConfig>,
    pub splits: Option<Vec<SweepSplit>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SweepBase {
    /// Base config path, relative to the sweep file.
    pub config: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SweepMeta {
    pub id: String,
    pub parallelism: Option<usize>,
    pub resume: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SweepParam {
    pub path: String,
    pub values: Vec<toml::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LeaderboardConfig {
    pub sort_by: Option<String>,
    pub descending: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SweepSplit {
    pub id: String,
    /// Epoch seconds or RFC3339, inclusive.
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepRunEntry {
    pub run_id: String,
    pub split_id: String,
    pub params: BTreeMap<String, toml::Value>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub summary: Option<MetricsSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub sweep_id: String,
    pub sweep_dir: PathBuf,
    pub base_config: String,
    pub runs: Vec<SweepRunEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct SweepProgress {
    pub total_runs: usize,
    pub completed_runs: usize,
    pub ok_runs: usize,
    pub skipped_runs: usize,
    pub error_runs: usize,
    pub last_run_id: Option<String>,
}

pub fn run_sweep(
    sweep_path: &Path,
    market_data: &dyn MarketDataRepository,
    catalog_repo: &(dyn CatalogRepository + Sync),
    artifacts: &(dyn ArtifactWriter + Sync),
) -> Result<SweepResult, String> {
    run_sweep_with_hooks(
        sweep_path,
        market_data,
        catalog_repo,
        artifacts,
        None,
        None,
    )
}

/// Expands the parameter grid over every split and runs each combination as an isolated
/// backtest on up to `parallelism` worker threads. Entries keep grid order.
pub fn run_sweep_with_hooks(
    sweep_path: &Path,
    market_data: &dyn MarketDataRepository,
    catalog_repo: &(dyn CatalogRepository + Sync),
    artifacts: &(dyn ArtifactWriter + Sync),
    mut on_progress: Option<&mut dyn FnMut(SweepProgress)>,
    should_cancel: Option<&(dyn Fn() -> bool + Sync)>,
) -> Result<SweepResult, String> {
    let sweep = read_sweep_file(sweep_path)?;
    let _span = info_span!("run_sweep", sweep_id = %sweep.sweep.id).entered();

    let base_path = base_config_path(sweep_path, &sweep.base.config);
    let (base_config, base_source) = crate::config::load_config_with_source(&base_path)?;
    let base_doc: toml::Value = toml::from_str(&base_source)
        .map_err(|err| format!("base config {} is not a TOML table: {err}", base_path.display()))?;

    let sweep_dir = PathBuf::from(&base_config.data.out_dir).join(&sweep.sweep.id);
    artifacts.ensure_dir(&sweep_dir)?;

    let timeframe = resolve_timeframe(&base_config)?;
    let (all_bars, _) = market_data.load_ohlcv(&OhlcvQuery {
        source: PathBuf::from(&base_config.data.ohlcv_path),
        symbol: Some(base_config.run.symbol.clone()),
        expected_step_seconds: Some(timeframe.step_seconds),
    })?;

    let grid = expand_grid(&sweep.params);
    let splits = sweep.splits.clone().unwrap_or_else(|| {
        vec![SweepSplit {
            id: "full".to_string(),
            start: None,
            end: None,
        }]
    });
    let workers = sweep.sweep.parallelism.unwrap_or(1).max(1);
    let resume = sweep.sweep.resume.unwrap_or(false);

    let mut tally = SweepProgress {
        total_runs: grid.len() * splits.len(),
        ..SweepProgress::default()
    };
    notify(&mut on_progress, &tally);

    let mut runs = Vec::with_capacity(tally.total_runs);
    for split in &splits {
        if cancel_requested(should_cancel) {
            return Err(CANCELLED.to_string());
        }
        let bars = filter_bars_for_split(&all_bars, split)?;
        let split_data = InMemoryMarketData {
            report: data_quality_from_bars(&bars, Some(timeframe.step_seconds)),
            bars,
        };

        let mut slots: Vec<Option<SweepRunEntry>> = vec![None; grid.len()];
        let mut pending = Vec::new();
        for (slot, assignment) in grid.iter().enumerate() {
            let job = prepare_job(&sweep.sweep.id, &base_doc, &sweep_dir, split, assignment, slot)?;
            if resume && job.summary_path.exists() {
                let entry = job.entry(
                    RunStatus::Skipped,
                    None,
                    read_summary(&job.summary_path).ok(),
                );
                record(&mut tally, &entry);
                notify(&mut on_progress, &tally);
                slots[slot] = Some(entry);
            } else {
                pending.push(job);
            }
        }

        let ctx = JobContext {
            sweep_dir: &sweep_dir,
            market_data: &split_data,
            catalog_repo,
            artifacts,
        };
        let finished = run_jobs(&pending, workers, &ctx, should_cancel, &mut |entry: &SweepRunEntry| {
            record(&mut tally, entry);
            notify(&mut on_progress, &tally);
        })?;
        for (slot, entry) in finished {
            slots[slot] = Some(entry);
        }
        runs.extend(slots.into_iter().flatten());
    }

    let result = SweepResult {
        sweep_id: sweep.sweep.id.clone(),
        sweep_dir: sweep_dir.clone(),
        base_config: base_path.display().to_string(),
        runs,
    };
    write_manifest(&sweep_dir.join("manifest.json"), &result)?;
    let rows = leaderboard_rows(&result, sweep.leaderboard.as_ref());
    artifacts.write_leaderboard_csv(&sweep_dir.join("leaderboard.csv"), &rows)?;

    metrics::counter!("vantage.sweep.runs_total").increment(result.runs.len() as u64);
    metrics::counter!("vantage.sweep.errors_total").increment(tally.error_runs as u64);
    tracing::info!(
        runs = result.runs.len(),
        ok = tally.ok_runs,
        skipped = tally.skipped_runs,
        errors = tally.error_runs,
        sweep_dir = %sweep_dir.display(),
        "sweep complete"
    );
    Ok(result)
}

const CANCELLED: &str = "sweep cancelled";

fn read_sweep_file(path: &Path) -> Result<SweepFile, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read sweep file {}: {err}", path.display()))?;
    let sweep: SweepFile = toml::from_str(&raw)
        .map_err(|err| format!("invalid sweep file {}: {err}", path.display()))?;
    if sweep.sweep.id.trim().is_empty() {
        return Err("sweep.id cannot be empty".to_string());
    }
    validate_param_paths(&sweep.params)?;
    Ok(sweep)
}

/// One grid cell on one split, ready to run.
struct SweepJob {
    slot: usize,
    run_id: String,
    split_id: String,
    params: BTreeMap<String, toml::Value>,
    config: Result<Config, String>,
    config_toml: String,
    summary_path: PathBuf,
}

impl SweepJob {
    fn entry(
        &self,
        status: RunStatus,
        error: Option<String>,
        summary: Option<MetricsSummary>,
    ) -> SweepRunEntry {
        SweepRunEntry {
            run_id: self.run_id.clone(),
            split_id: self.split_id.clone(),
            params: self.params.clone(),
            status,
            error,
            summary,
        }
    }
}

struct JobContext<'a> {
    sweep_dir: &'a Path,
    market_data: &'a InMemoryMarketData,
    catalog_repo: &'a (dyn CatalogRepository + Sync),
    artifacts: &'a (dyn ArtifactWriter + Sync),
}

fn prepare_job(
    sweep_id: &str,
    base_doc: &toml::Value,
    sweep_dir: &Path,
    split: &SweepSplit,
    assignment: &BTreeMap<String, toml::Value>,
    slot: usize,
) -> Result<SweepJob, String> {
    let run_id = format!(
        "{sweep_id}__{}__{}",
        assignment_hash(&split.id, assignment),
        split.id
    );
    let mut doc = base_doc.clone();
    for (path, value) in assignment {
        set_path_value(&mut doc, path, value.clone())?;
    }
    set_path_value(&mut doc, "run.run_id", toml::Value::String(run_id.clone()))?;
    let config_toml = toml::to_string_pretty(&doc)
        .map_err(|err| format!("failed to render config for {run_id}: {err}"))?;

    Ok(SweepJob {
        slot,
        summary_path: sweep_dir.join(&run_id).join(SUMMARY_FILE),
        run_id,
        split_id: split.id.clone(),
        params: assignment.clone(),
        // A combination that fails validation becomes an error entry, not a sweep failure.
        config: parse_config(&config_toml),
        config_toml,
    })
}

/// Runs `jobs` on a scoped worker pool. Finished entries reach `on_entry` on the calling
/// thread as they complete; the returned pairs carry each job's grid slot.
fn run_jobs(
    jobs: &[SweepJob],
    workers: usize,
    ctx: &JobContext<'_>,
    should_cancel: Option<&(dyn Fn() -> bool + Sync)>,
    on_entry: &mut dyn FnMut(&SweepRunEntry),
) -> Result<Vec<(usize, SweepRunEntry)>, String> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }
    let next = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);
    let (tx, rx) = mpsc::channel::<(usize, SweepRunEntry)>();

    let finished = std::thread::scope(|scope| {
        for _ in 0..workers.min(jobs.len()) {
            let tx = tx.clone();
            let (next, stop) = (&next, &stop);
            scope.spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if cancel_requested(should_cancel) {
                        stop.store(true, Ordering::Relaxed);
                        break;
                    }
                    let Some(job) = jobs.get(next.fetch_add(1, Ordering::Relaxed)) else {
                        break;
                    };
                    if tx.send((job.slot, execute_job(job, ctx))).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut finished = Vec::with_capacity(jobs.len());
        for (slot, entry) in rx {
            on_entry(&entry);
            finished.push((slot, entry));
        }
        finished
    });

    if stop.load(Ordering::Relaxed) {
        return Err(CANCELLED.to_string());
    }
    if finished.len() != jobs.len() {
        return Err(format!(
            "sweep workers returned {} of {} runs",
            finished.len(),
            jobs.len()
        ));
    }
    Ok(finished)
}

fn execute_job(job: &SweepJob, ctx: &JobContext<'_>) -> SweepRunEntry {
    let outcome = job
        .config
        .as_ref()
        .map_err(Clone::clone)
        .and_then(|config| {
            crate::backtesting::run_backtest(
                config,
                &job.config_toml,
                Some(ctx.sweep_dir.to_path_buf()),
                ctx.market_data,
                ctx.catalog_repo,
                ctx.artifacts,
            )
        })
        .and_then(|_| read_summary(&job.summary_path));

    match outcome {
        Ok(summary) => job.entry(RunStatus::Ok, None, Some(summary)),
        Err(err) => {
            tracing::warn!(run_id = %job.run_id, error = %err, "sweep run failed");
            job.entry(RunStatus::Error, Some(err), None)
        }
    }
}

fn cancel_requested(should_cancel: Option<&(dyn Fn() -> bool + Sync)>) -> bool {
    should_cancel.is_some_and(|cancel| cancel())
}

fn record(tally: &mut SweepProgress, entry: &SweepRunEntry) {
    tally.completed_runs += 1;
    tally.last_run_id = Some(entry.run_id.clone());
    let counter = match entry.status {
        RunStatus::Ok => &mut tally.ok_runs,
        RunStatus::Skipped => &mut tally.skipped_runs,
        RunStatus::Error => &mut tally.error_runs,
    };
    *counter += 1;
}

fn notify(on_progress: &mut Option<&mut dyn FnMut(SweepProgress)>, tally: &SweepProgress) {
    if let Some(callback) = on_progress {
        callback(tally.clone());
    }
}

fn base_config_path(sweep_path: &Path, base: &str) -> PathBuf {
    let base = Path::new(base);
    match sweep_path.parent() {
        Some(dir) if base.is_relative() => dir.join(base),
        _ => base.to_path_buf(),
    }
}

fn validate_param_paths(params: &[SweepParam]) -> Result<(), String> {
    for param in params {
        let path = param.path.trim();
        if path.is_empty() {
            return Err("sweep params need a non-empty path".to_string());
        }
        if let Some(prefix) = FORBIDDEN_PREFIXES
            .iter()
            .find(|prefix| path.starts_with(*prefix))
        {
            return Err(format!(
                "sweep param path not allowed: {path} ({prefix} is fixed for the whole sweep)"
            ));
        }
        if param.values.is_empty() {
            return Err(format!("sweep param {path} lists no values"));
        }
    }
    Ok(())
}

/// Cartesian product of the parameter values; the first parameter varies slowest.
fn expand_grid(params: &[SweepParam]) -> Vec<BTreeMap<String, toml::Value>> {
    params
        .iter()
        .fold(vec![BTreeMap::new()], |combos, param| {
            let path = param.path.trim();
            combos
                .iter()
                .flat_map(|combo| {
                    param.values.iter().map(move |value| {
                        let mut next = combo.clone();
                        next.insert(path.to_string(), value.clone());
                        next
                    })
                })
                .collect()
        })
}

/// First 12 hex chars of a SHA-256 over the split id and the sorted assignment.
fn assignment_hash(split_id: &str, assignment: &BTreeMap<String, toml::Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(split_id.as_bytes());
    for (path, value) in assignment {
        hasher.update(b"\n");
        hasher.update(path.as_bytes());
        hasher.update(b"=");
        hasher.update(value.to_string().as_bytes());
    }
    to_hex(&hasher.finalize())[..12].to_string()
}

/// Sets a dotted path, creating missing tables so optional sections such as
/// `execution.max_fill_pct_of_volume` can be swept without appearing in the base config.
fn set_path_value(root: &mut toml::Value, path: &str, value: toml::Value) -> Result<(), String> {
    let keys: Vec<&str> = path
        .split('.')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .collect();
    let Some((leaf, tables)) = keys.split_last() else {
        return Err("empty path".to_string());
    };
    let not_a_table = || format!("path is not a table: {path}");

    let mut node = root;
    for key in tables {
        node = node
            .as_table_mut()
            .ok_or_else(not_a_table)?
            .entry(*key)
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    }
    node.as_table_mut()
        .ok_or_else(not_a_table)?
        .insert((*leaf).to_string(), value);
    Ok(())
}

fn filter_bars_for_split(bars: &[Bar], split: &SweepSplit) -> Result<Vec<Bar>, String> {
    let bound = |raw: &Option<String>| raw.as_deref().map(parse_split_bound).transpose();
    let start = bound(&split.start)?;
    let end = bound(&split.end)?;
    if matches!((start, end), (Some(start), Some(end)) if start > end) {
        return Err(format!("split '{}' starts after it ends", split.id));
    }
    Ok(bars
        .iter()
        .filter(|bar| start.map_or(true, |start| bar.timestamp >= start))
        .filter(|bar| end.map_or(true, |end| bar.timestamp <= end))
        .cloned()
        .collect())
}

fn parse_split_bound(raw: &str) -> Result<i64, String> {
    let raw = raw.trim();
    if let Ok(epoch) = raw.parse::<i64>() {
        return Ok(epoch);
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp())
        .map_err(|err| format!("split bound '{raw}' is neither epoch seconds nor RFC 3339: {err}"))
}

fn read_summary(path: &Path) -> Result<MetricsSummary, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    let mut doc: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| format!("invalid json in {}: {err}", path.display()))?;
    let summary = doc
        .get_mut("summary")
        .map(serde_json::Value::take)
        .ok_or_else(|| format!("{} has no summary section", path.display()))?;
    serde_json::from_value(summary)
        .map_err(|err| format!("unexpected summary in {}: {err}", path.display()))
}

fn write_manifest(path: &Path, result: &SweepResult) -> Result<(), String> {
    let json = serde_json::to_string_pretty(result)
        .map_err(|err| format!("failed to serialize sweep manifest: {err}"))?;
    std::fs::write(path, json).map_err(|err| format!("failed to write {}: {err}", path.display()))
}

fn leaderboard_rows(result: &SweepResult, config: Option<&LeaderboardConfig>) -> Vec<LeaderboardRow> {
    let key = config
        .and_then(|c| c.sort_by.as_deref())
        .unwrap_or("sharpe")
        .trim()
        .to_lowercase();
    let descending = config.and_then(|c| c.descending).unwrap_or(true);

    let mut rows: Vec<LeaderboardRow> = result
        .runs
        .iter()
        .filter(|run| run.status != RunStatus::Error)
        .filter_map(|run| {
            Some(LeaderboardRow {
                run_id: run.run_id.clone(),
                params: format_params(&run.params),
                summary: run.summary.clone()?,
            })
        })
        .collect();
    rows.sort_by(|a, b| {
        let by_metric = metric_value(&a.summary, &key).total_cmp(&metric_value(&b.summary, &key));
        let by_metric = if descending {
            by_metric.reverse()
        } else {
            by_metric
        };
        by_metric.then_with(|| a.run_id.cmp(&b.run_id))
    });
    rows
}

fn format_params(params: &BTreeMap<String, toml::Value>) -> String {
    let pairs: Vec<String> = params
        .iter()
        .map(|(path, value)| format!("{path}={value}"))
        .collect();
    pairs.join(" ")
}

fn metric_value(summary: &MetricsSummary, key: &str) -> f64 {
    match key {
        "net_profit" => summary.net_profit,
        "total_return" => summary.total_return,
        "max_drawdown" => summary.max_drawdown,
        "win_rate" => summary.win_rate,
        "trades" => summary.trades as f64,
        "final_equity" => summary.final_equity,
        "profit_factor" => summary.profit_factor.unwrap_or(f64::INFINITY),
        _ => summary.sharpe,
    }
}

/// Bars already sliced for one split, served to every run of that split.
struct InMemoryMarketData {
    bars: Vec<Bar>,
    report: DataQualityReport,
}

impl MarketDataRepository for InMemoryMarketData {
    fn load_ohlcv(&self, _query: &OhlcvQuery) -> Result<(Vec<Bar>, DataQualityReport), String> {
        Ok((self.bars.clone(), self.report.clone()))
    }
}
