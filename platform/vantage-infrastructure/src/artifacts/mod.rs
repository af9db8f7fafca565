mod files;

use std::fs;
use std::path::Path;
use std::time::Instant;
use vantage_domain::entities::metrics::MetricsSummary;
use vantage_domain::repositories::artifacts::{ArtifactReader, ArtifactWriter, LeaderboardRow};
use vantage_domain::services::audit::AuditEvent;
use vantage_domain::value_objects::equity_point::EquityPoint;
use vantage_domain::value_objects::fill::Fill;
use vantage_domain::value_objects::trade::Trade;

pub use files::LEADERBOARD_HEADER;

const TRADES_HEADER: [&str; 13] = [
    "symbol",
    "side",
    "quantity",
    "entry_price",
    "exit_price",
    "entry_time",
    "exit_time",
    "leverage",
    "pnl",
    "pnl_pct",
    "fees",
    "funding",
    "exit_reason",
];

const FILLS_HEADER: [&str; 11] = [
    "order_id",
    "symbol",
    "side",
    "kind",
    "price",
    "quantity",
    "fee",
    "liquidity",
    "slippage",
    "funding",
    "timestamp",
];

const EQUITY_HEADER: [&str; 9] = [
    "timestamp",
    "equity",
    "realized_pnl",
    "unrealized_pnl",
    "fees",
    "funding",
    "drawdown",
    "cumulative_return",
    "open_positions",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemArtifactWriter;

impl FilesystemArtifactWriter {
    pub fn new() -> Self {
        Self
    }
}

fn result_label<T>(result: &Result<T, String>) -> &'static str {
    if result.is_ok() {
        "ok"
    } else {
        "err"
    }
}

fn record_write_metrics(kind: &'static str, start: Instant, result: &Result<(), String>) {
    let result_label = result_label(result);
    metrics::counter!(
        "vantage.infra.artifacts.write.calls_total",
        "kind" => kind,
        "result" => result_label
    )
    .increment(1);
    metrics::histogram!("vantage.infra.artifacts.write_ms", "kind" => kind, "result" => result_label)
        .record(start.elapsed().as_secs_f64() * 1_000.0);
}

fn record_read_metrics<T>(kind: &'static str, start: Instant, result: &Result<T, String>) {
    let result_label = result_label(result);
    metrics::counter!(
        "vantage.infra.artifacts.read.calls_total",
        "kind" => kind,
        "result" => result_label
    )
    .increment(1);
    metrics::histogram!("vantage.infra.artifacts.read_ms", "kind" => kind, "result" => result_label)
        .record(start.elapsed().as_secs_f64() * 1_000.0);
}

impl ArtifactWriter for FilesystemArtifactWriter {
    fn ensure_dir(&self, path: &Path) -> Result<(), String> {
        let start = Instant::now();
        let result = fs::create_dir_all(path)
            .map_err(|err| format!("failed to create dir {}: {}", path.display(), err));
        record_write_metrics("ensure_dir", start, &result);
        result
    }

    fn write_trades_csv(&self, path: &Path, trades: &[Trade]) -> Result<(), String> {
        let start = Instant::now();
        let result = files::write_records_csv(path, trades, &TRADES_HEADER, "trades");
        record_write_metrics("trades_csv", start, &result);
        result
    }

    fn write_fills_csv(&self, path: &Path, fills: &[Fill]) -> Result<(), String> {
        let start = Instant::now();
        let result = files::write_records_csv(path, fills, &FILLS_HEADER, "fills");
        record_write_metrics("fills_csv", start, &result);
        result
    }

    fn write_equity_csv(&self, path: &Path, points: &[EquityPoint]) -> Result<(), String> {
        let start = Instant::now();
        let result = files::write_records_csv(path, points, &EQUITY_HEADER, "equity");
        record_write_metrics("equity_csv", start, &result);
        result
    }

    fn write_summary_json(
        &self,
        path: &Path,
        summary: &MetricsSummary,
        meta: Option<&serde_json::Value>,
        config_snapshot: Option<&serde_json::Value>,
    ) -> Result<(), String> {
        let start = Instant::now();
        let result = files::write_summary_json(path, summary, meta, config_snapshot);
        record_write_metrics("summary_json", start, &result);
        result
    }

    fn write_audit_jsonl(&self, path: &Path, events: &[AuditEvent]) -> Result<(), String> {
        let start = Instant::now();
        let result = files::write_audit_jsonl(path, events);
        record_write_metrics("audit_jsonl", start, &result);
        result
    }

    fn write_config_snapshot_toml(&self, path: &Path, contents: &str) -> Result<(), String> {
        let start = Instant::now();
        let result = fs::write(path, contents).map_err(|err| {
            format!(
                "failed to write config snapshot {}: {}",
                path.display(),
                err
            )
        });
        record_write_metrics("config_snapshot_toml", start, &result);
        result
    }

    fn write_leaderboard_csv(&self, path: &Path, rows: &[LeaderboardRow]) -> Result<(), String> {
        let start = Instant::now();
        let result = files::write_leaderboard_csv(path, rows);
        record_write_metrics("leaderboard_csv", start, &result);
        result
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemArtifactReader;

impl FilesystemArtifactReader {
    pub fn new() -> Self {
        Self
    }
}

impl ArtifactReader for FilesystemArtifactReader {
    fn read_trades_csv(&self, path: &Path) -> Result<Vec<Trade>, String> {
        let start = Instant::now();
        let result = files::read_records_csv(path, "trades");
        record_read_metrics("trades_csv", start, &result);
        result
    }

    fn read_equity_csv(&self, path: &Path) -> Result<Vec<EquityPoint>, String> {
        let start = Instant::now();
        let result = files::read_records_csv(path, "equity");
        record_read_metrics("equity_csv", start, &result);
        result
    }

    fn read_summary_json(&self, path: &Path) -> Result<serde_json::Value, String> {
        let start = Instant::now();
        let result = files::read_summary_json(path);
        record_read_metrics("summary_json", start, &result);
        result
    }

    fn read_config_snapshot_toml(&self, path: &Path) -> Result<Option<String>, String> {
        if !path.exists() {
            return Ok(None);
        }
        let start = Instant::now();
        let result = fs::read_to_string(path)
            .map(Some)
            .map_err(|err| format!("failed to read config snapshot {}: {}", path.display(), err));
        record_read_metrics("config_snapshot_toml", start, &result);
        result
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};
    use vantage_domain::value_objects::fill::{FillKind, Liquidity};
    use vantage_domain::value_objects::side::Side;
    use vantage_domain::value_objects::trade::ExitReason;

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "vantage_artifacts_{name}_{}_{nanos}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn trade(pnl: f64) -> Trade {
        Trade {
            symbol: "BTC_USDT".to_string(),
            side: Side::Short,
            quantity: 0.125,
            entry_price: 30_000.1,
            exit_price: 29_000.7,
            entry_time: 1_700_000_000,
            exit_time: 1_700_003_600,
            leverage: 3.0,
            pnl,
            pnl_pct: pnl / 3_750.0,
            fees: 1.0 / 3.0,
            funding: -0.02,
            exit_reason: ExitReason::TakeProfit,
        }
    }

    fn point(ts: i64, equity: f64) -> EquityPoint {
        EquityPoint {
            timestamp: ts,
            equity,
            realized_pnl: equity - 10_000.0,
            unrealized_pnl: 0.1 + 0.2,
            fees: 0.5,
            funding: 0.0,
            drawdown: 0.01,
            cumulative_return: equity / 10_000.0 - 1.0,
            open_positions: 1,
        }
    }

    #[test]
    fn trades_and_equity_read_back_exactly() {
        let dir = temp_dir("roundtrip");
        let writer = FilesystemArtifactWriter::new();
        let reader = FilesystemArtifactReader::new();
        let trades = vec![trade(124.9), trade(-17.25)];
        let equity = vec![point(60, 10_124.9), point(120, 10_107.65)];

        writer
            .write_trades_csv(&dir.join("trades.csv"), &trades)
            .expect("write trades");
        writer
            .write_equity_csv(&dir.join("equity.csv"), &equity)
            .expect("write equity");

        assert_eq!(
            reader.read_trades_csv(&dir.join("trades.csv")).expect("read"),
            trades
        );
        assert_eq!(
            reader.read_equity_csv(&dir.join("equity.csv")).expect("read"),
            equity
        );
        let raw = std::fs::read_to_string(dir.join("trades.csv")).expect("raw");
        assert!(raw.starts_with("symbol,side,quantity,"));
        assert!(raw.contains(",short,"));
        assert!(raw.contains(",take_profit"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_artifacts_still_carry_headers() {
        let dir = temp_dir("empty");
        let writer = FilesystemArtifactWriter::new();
        writer
            .write_trades_csv(&dir.join("trades.csv"), &[])
            .expect("trades");
        writer
            .write_fills_csv(&dir.join("fills.csv"), &[])
            .expect("fills");
        let raw = std::fs::read_to_string(dir.join("fills.csv")).expect("raw");
        assert_eq!(raw.trim_end(), FILLS_HEADER.join(","));
        let trades = FilesystemArtifactReader::new()
            .read_trades_csv(&dir.join("trades.csv"))
            .expect("read");
        assert!(trades.is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn fills_leave_missing_order_id_blank() {
        let dir = temp_dir("fills");
        let fill = Fill {
            order_id: None,
            symbol: "BTC_USDT".to_string(),
            side: Side::Long,
            kind: FillKind::Liquidation,
            price: 25_000.0,
            quantity: 0.5,
            fee: 6.25,
            liquidity: Liquidity::Taker,
            slippage: 0.0,
            funding: 0.0,
            timestamp: 1_700_000_060,
        };
        FilesystemArtifactWriter::new()
            .write_fills_csv(&dir.join("fills.csv"), &[fill])
            .expect("fills");
        let raw = std::fs::read_to_string(dir.join("fills.csv")).expect("raw");
        let row = raw.lines().nth(1).expect("row");
        assert!(row.starts_with(",BTC_USDT,long,liquidation,"));
        assert!(row.contains(",taker,"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn summary_json_nests_meta_snapshot_and_metrics() {
        let dir = temp_dir("summary");
        let path = dir.join("summary.json");
        let summary = MetricsSummary {
            bars_processed: 42,
            trades: 2,
            profit_factor: None,
            final_equity: 10_107.65,
            ..MetricsSummary::default()
        };
        let meta = serde_json::json!({"run_id": "r1", "mode": "backtest"});
        let snapshot = serde_json::json!({"run": {"symbol": "BTC_USDT"}});
        FilesystemArtifactWriter::new()
            .write_summary_json(&path, &summary, Some(&meta), Some(&snapshot))
            .expect("summary");

        let stored = FilesystemArtifactReader::new()
            .read_summary_json(&path)
            .expect("read");
        assert_eq!(stored["meta"]["run_id"], "r1");
        assert_eq!(stored["config_snapshot"]["run"]["symbol"], "BTC_USDT");
        assert_eq!(stored["summary"]["bars_processed"], 42);
        assert!(stored["summary"]["profit_factor"].is_null());
        let parsed: MetricsSummary =
            serde_json::from_value(stored["summary"].clone()).expect("summary shape");
        assert_eq!(parsed, summary);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn audit_log_is_one_json_object_per_line() {
        let dir = temp_dir("audit");
        let path = dir.join("audit.jsonl");
        let events = vec![
            AuditEvent {
                run_id: "r1".to_string(),
                timestamp: 60,
                stage: "risk".to_string(),
                symbol: Some("BTC_USDT".to_string()),
                action: "reject".to_string(),
                error: Some("max_leverage".to_string()),
                details: serde_json::json!({"leverage": 20.0}),
            },
            AuditEvent {
                run_id: "r1".to_string(),
                timestamp: 120,
                stage: "engine".to_string(),
                symbol: None,
                action: "run_end".to_string(),
                error: None,
                details: serde_json::Value::Null,
            },
        ];
        FilesystemArtifactWriter::new()
            .write_audit_jsonl(&path, &events)
            .expect("audit");
        let raw = std::fs::read_to_string(&path).expect("raw");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("json");
        assert_eq!(second["action"], "run_end");
        assert!(second.get("symbol").is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn leaderboard_ranks_rows_in_given_order() {
        let dir = temp_dir("leaderboard");
        let path = dir.join("leaderboard.csv");
        let rows = vec![
            LeaderboardRow {
                run_id: "sweep__a".to_string(),
                params: "strategy.short_window=5".to_string(),
                summary: MetricsSummary {
                    net_profit: 250.0,
                    profit_factor: Some(2.5),
                    ..MetricsSummary::default()
                },
            },
            LeaderboardRow {
                run_id: "sweep__b".to_string(),
                params: "strategy.short_window=10".to_string(),
                summary: MetricsSummary {
                    net_profit: -40.0,
                    ..MetricsSummary::default()
                },
            },
        ];
        FilesystemArtifactWriter::new()
            .write_leaderboard_csv(&path, &rows)
            .expect("leaderboard");

        let mut rdr = csv::Reader::from_path(&path).expect("reader");
        let header = rdr.headers().expect("header").clone();
        assert_eq!(header.iter().collect::<Vec<_>>(), LEADERBOARD_HEADER.to_vec());
        let records: Vec<csv::StringRecord> =
            rdr.records().collect::<Result<_, _>>().expect("records");
        assert_eq!(&records[0][0], "1");
        assert_eq!(&records[0][1], "sweep__a");
        assert_eq!(&records[0][8], "2.5");
        assert_eq!(&records[1][0], "2");
        assert_eq!(&records[1][8], "");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_config_snapshot_is_none() {
        let dir = temp_dir("snapshot");
        let reader = FilesystemArtifactReader::new();
        assert_eq!(
            reader
                .read_config_snapshot_toml(&dir.join("config.toml"))
                .expect("read"),
            None
        );
        FilesystemArtifactWriter::new()
            .write_config_snapshot_toml(&dir.join("config.toml"), "[run]\nrun_id = \"r1\"\n")
            .expect("write");
        assert!(reader.exists(&dir.join("config.toml")));
        assert!(reader
            .read_config_snapshot_toml(&dir.join("config.toml"))
            .expect("read")
            .is_some_and(|text| text.contains("run_id")));
        assert!(reader.read_trades_csv(&dir.join("trades.csv")).is_err());
        let _ = std::fs::remove_dir_all(dir);
    }
}
