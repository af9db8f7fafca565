use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use vantage_domain::entities::metrics::MetricsSummary;
use vantage_domain::repositories::artifacts::LeaderboardRow;
use vantage_domain::services::audit::AuditEvent;

/// Writes one CSV row per record, header taken from the record's field names. An empty slice
/// still produces the header.
pub fn write_records_csv<T: Serialize>(
    path: &Path,
    records: &[T],
    header: &[&str],
    what: &str,
) -> Result<(), String> {
    let mut wtr = csv::Writer::from_path(path)
        .map_err(|err| format!("failed to create {what} csv {}: {}", path.display(), err))?;
    if records.is_empty() {
        wtr.write_record(header)
            .map_err(|err| format!("failed to write {what} csv header: {err}"))?;
    }
    for record in records {
        wtr.serialize(record)
            .map_err(|err| format!("failed to write {what} row: {err}"))?;
    }
    wtr.flush()
        .map_err(|err| format!("failed to flush {what} csv: {err}"))
}

pub fn read_records_csv<T: DeserializeOwned>(path: &Path, what: &str) -> Result<Vec<T>, String> {
    let mut rdr = csv::Reader::from_path(path)
        .map_err(|err| format!("failed to open {what} csv {}: {}", path.display(), err))?;
    let mut records = Vec::new();
    for (idx, row) in rdr.deserialize().enumerate() {
        // Header is line 1.
        let record: T =
            row.map_err(|err| format!("invalid {what} row at line {}: {}", idx + 2, err))?;
        records.push(record);
    }
    Ok(records)
}

pub fn write_audit_jsonl(path: &Path, events: &[AuditEvent]) -> Result<(), String> {
    let file = fs::File::create(path)
        .map_err(|err| format!("failed to create audit log {}: {}", path.display(), err))?;
    let mut out = BufWriter::new(file);
    for event in events {
        let line = serde_json::to_string(event)
            .map_err(|err| format!("failed to serialize audit event: {err}"))?;
        out.write_all(line.as_bytes())
            .and_then(|_| out.write_all(b"\n"))
            .map_err(|err| format!("failed to write audit event: {err}"))?;
    }
    out.flush()
        .map_err(|err| format!("failed to flush audit log: {err}"))
}

pub fn write_summary_json(
    path: &Path,
    summary: &MetricsSummary,
    meta: Option<&serde_json::Value>,
    config_snapshot: Option<&serde_json::Value>,
) -> Result<(), String> {
    let json = serde_json::json!({
        "meta": meta,
        "config_snapshot": config_snapshot,
        "summary": summary,
    });
    let json = serde_json::to_string_pretty(&json)
        .map_err(|err| format!("failed to serialize summary: {err}"))?;
    fs::write(path, json)
        .map_err(|err| format!("failed to write summary {}: {}", path.display(), err))
}

pub fn read_summary_json(path: &Path) -> Result<serde_json::Value, String> {
    let contents = fs::read_to_string(path)
        .map_err(|err| format!("failed to read summary {}: {}", path.display(), err))?;
    serde_json::from_str(&contents)
        .map_err(|err| format!("invalid summary json {}: {}", path.display(), err))
}

pub const LEADERBOARD_HEADER: [&str; 12] = [
    "rank",
    "run_id",
    "params",
    "net_profit",
    "total_return",
    "sharpe",
    "max_drawdown",
    "win_rate",
    "profit_factor",
    "trades",
    "liquidations",
    "final_equity",
];

/// Rows are written in the order given; ranking is the caller's concern.
pub fn write_leaderboard_csv(path: &Path, rows: &[LeaderboardRow]) -> Result<(), String> {
    let mut wtr = csv::Writer::from_path(path)
        .map_err(|err| format!("failed to create leaderboard {}: {}", path.display(), err))?;
    wtr.write_record(LEADERBOARD_HEADER)
        .map_err(|err| format!("failed to write leaderboard header: {err}"))?;
    for (idx, row) in rows.iter().enumerate() {
        let summary = &row.summary;
        wtr.write_record([
            (idx + 1).to_string(),
            row.run_id.clone(),
            row.params.clone(),
            summary.net_profit.to_string(),
            summary.total_return.to_string(),
            summary.sharpe.to_string(),
            summary.max_drawdown.to_string(),
            summary.win_rate.to_string(),
            summary
                .profit_factor
                .map(|pf| pf.to_string())
                .unwrap_or_default(),
            summary.trades.to_string(),
            summary.liquidations.to_string(),
            summary.final_equity.to_string(),
        ])
        .map_err(|err| format!("failed to write leaderboard row: {err}"))?;
    }
    wtr.flush()
        .map_err(|err| format!("failed to flush leaderboard: {err}"))
}
