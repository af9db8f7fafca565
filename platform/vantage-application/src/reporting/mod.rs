use crate::config::parse_config;
use crate::shared::{
    build_metrics_config, run_fingerprint, CONFIG_FILE, EQUITY_FILE, SUMMARY_FILE, TRADES_FILE,
};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info_span;
use vantage_domain::entities::metrics::{recompute_summary, MetricsConfig, MetricsSummary};
use vantage_domain::repositories::artifacts::ArtifactReader;

const TOLERANCE: f64 = 1e-9;

pub struct GenerateReportResult {
    pub input_dir: PathBuf,
    pub run_id: String,
    pub summary: MetricsSummary,
    /// Summary fields whose recomputed value differs from `summary.json`.
    pub mismatches: Vec<String>,
    /// `None` when `summary.json` carries no fingerprint.
    pub fingerprint_matches: Option<bool>,
}

impl GenerateReportResult {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty() && self.fingerprint_matches != Some(false)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "input_dir": self.input_dir.display().to_string(),
            "run_id": self.run_id,
            "consistent": self.is_consistent(),
            "mismatches": self.mismatches,
            "fingerprint_matches": self.fingerprint_matches,
            "summary": self.summary,
        })
    }
}

/// Re-reads a run directory, rebuilds the summary from `trades.csv` and `equity.csv` alone and
/// checks it (and the trades/equity fingerprint) against the stored `summary.json`.
pub fn generate_report(
    input_dir: &Path,
    reader: &dyn ArtifactReader,
) -> Result<GenerateReportResult, String> {
    let _span = info_span!("generate_report", input_dir = %input_dir.display()).entered();

    let stage_start = Instant::now();
    let trades_path = input_dir.join(TRADES_FILE);
    let equity_path = input_dir.join(EQUITY_FILE);
    let summary_path = input_dir.join(SUMMARY_FILE);

    for path in [&trades_path, &equity_path, &summary_path] {
        if !reader.exists(path) {
            return Err(format!("missing {} in run directory", path.display()));
        }
    }

    let trades = reader.read_trades_csv(&trades_path)?;
    let equity = reader.read_equity_csv(&equity_path)?;
    let stored = reader.read_summary_json(&summary_path)?;
    let meta = stored.get("meta").cloned().unwrap_or(serde_json::Value::Null);

    let config_toml = reader.read_config_snapshot_toml(&input_dir.join(CONFIG_FILE))?;
    let metrics_config = match config_toml.as_deref() {
        Some(raw) => build_metrics_config(
            &parse_config(raw).map_err(|err| format!("invalid config snapshot: {err}"))?,
        ),
        None => snapshot_metrics_config(&stored),
    };
    let initial_capital = meta
        .get("initial_capital")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| "summary.json meta has no initial_capital".to_string())?;

    let summary = recompute_summary(initial_capital, &trades, &equity, metrics_config);
    metrics::histogram!("vantage.report.generate_ms")
        .record(stage_start.elapsed().as_millis() as f64);
    metrics::gauge!("vantage.report.trades").set(trades.len() as f64);

    let stored_summary: MetricsSummary = stored
        .get("summary")
        .cloned()
        .ok_or_else(|| "summary.json has no summary section".to_string())
        .and_then(|value| {
            serde_json::from_value(value)
                .map_err(|err| format!("failed to parse stored summary: {err}"))
        })?;
    let mismatches = compare_summaries(&summary, &stored_summary);

    let fingerprint_matches = match meta
        .get("fingerprint")
        .and_then(|f| f.get("trades_equity"))
        .and_then(|v| v.as_str())
    {
        Some(stored) => Some(run_fingerprint(&trades, &equity)? == stored),
        None => None,
    };

    let run_id = meta
        .get("run_id")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    if mismatches.is_empty() && fingerprint_matches != Some(false) {
        tracing::info!(run_id = %run_id, "recomputed summary matches stored summary");
    } else {
        tracing::warn!(
            run_id = %run_id,
            mismatches = %mismatches.join(","),
            fingerprint_matches = ?fingerprint_matches,
            "recomputed summary differs from stored summary"
        );
    }

    Ok(GenerateReportResult {
        input_dir: input_dir.to_path_buf(),
        run_id,
        summary,
        mismatches,
        fingerprint_matches,
    })
}

fn compare_summaries(recomputed: &MetricsSummary, stored: &MetricsSummary) -> Vec<String> {
    let mut mismatches = Vec::new();
    let counts = [
        ("bars_processed", recomputed.bars_processed, stored.bars_processed),
        ("trades", recomputed.trades, stored.trades),
        ("wins", recomputed.wins, stored.wins),
        ("losses", recomputed.losses, stored.losses),
        ("liquidations", recomputed.liquidations, stored.liquidations),
    ];
    for (name, a, b) in counts {
        if a != b {
            mismatches.push(name.to_string());
        }
    }

    let values = [
        ("win_rate", recomputed.win_rate, stored.win_rate),
        ("gross_profit", recomputed.gross_profit, stored.gross_profit),
        ("gross_loss", recomputed.gross_loss, stored.gross_loss),
        ("net_profit", recomputed.net_profit, stored.net_profit),
        ("total_fees", recomputed.total_fees, stored.total_fees),
        ("total_funding", recomputed.total_funding, stored.total_funding),
        ("sharpe", recomputed.sharpe, stored.sharpe),
        ("max_drawdown", recomputed.max_drawdown, stored.max_drawdown),
        ("final_equity", recomputed.final_equity, stored.final_equity),
        ("total_return", recomputed.total_return, stored.total_return),
    ];
    for (name, a, b) in values {
        if !close_enough(a, b) {
            mismatches.push(name.to_string());
        }
    }

    let profit_factor_matches = match (recomputed.profit_factor, stored.profit_factor) {
        (Some(a), Some(b)) => close_enough(a, b),
        (None, None) => true,
        _ => false,
    };
    if !profit_factor_matches {
        mismatches.push("profit_factor".to_string());
    }
    mismatches
}

fn close_enough(a: f64, b: f64) -> bool {
    (a - b).abs() <= TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

/// Metrics settings recorded in `summary.json` for runs without a `config.toml`.
fn snapshot_metrics_config(stored: &serde_json::Value) -> MetricsConfig {
    let metrics = &stored["config_snapshot"]["metrics"];
    let defaults = MetricsConfig::default();
    MetricsConfig {
        risk_free_rate: metrics["risk_free_rate"]
            .as_f64()
            .unwrap_or(defaults.risk_free_rate),
        annualization_factor: metrics["annualization_factor"]
            .as_f64()
            .or(defaults.annualization_factor),
    }
}
