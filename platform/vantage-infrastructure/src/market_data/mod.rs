use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::fs::File;
use std::path::Path;
use std::time::Instant;
use vantage_domain::repositories::market_data::{MarketDataRepository, OhlcvQuery};
use vantage_domain::services::ohlcv::{data_quality_from_bars, DataQualityReport};
use vantage_domain::value_objects::bar::Bar;

const TIMESTAMP_COLUMNS: [&str; 6] = [
    "timestamp",
    "timestamp_utc",
    "time",
    "ts",
    "date",
    "open_time",
];
const VOLUME_COLUMNS: [&str; 4] = ["volume", "vol", "quantity", "base_volume"];
/// Integer timestamps above this are taken as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;
const UNKNOWN_SYMBOL: &str = "UNKNOWN";

/// OHLCV rows from a CSV file with a header line. Rows keep file order: ordering, duplicate and
/// gap problems are reported, not repaired, so the engine sees the data as it is.
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvOhlcvRepository;

impl CsvOhlcvRepository {
    pub fn new() -> Self {
        Self
    }
}

impl MarketDataRepository for CsvOhlcvRepository {
    fn load_ohlcv(&self, query: &OhlcvQuery) -> Result<(Vec<Bar>, DataQualityReport), String> {
        let start = Instant::now();
        let result = load_csv(&query.source, query.symbol.as_deref(), query.expected_step_seconds);
        let result_label = if result.is_ok() { "ok" } else { "err" };
        metrics::counter!("vantage.infra.ohlcv.load.calls_total", "result" => result_label)
            .increment(1);
        metrics::histogram!("vantage.infra.ohlcv.load_ms", "result" => result_label)
            .record(start.elapsed().as_secs_f64() * 1_000.0);
        if let Ok((bars, report)) = &result {
            metrics::gauge!("vantage.infra.ohlcv.rows").set(bars.len() as f64);
            tracing::debug!(
                source = %query.source.display(),
                rows = bars.len(),
                duplicates = report.duplicates,
                gaps = report.gaps,
                "ohlcv loaded"
            );
        }
        result
    }
}

#[derive(Debug, Clone, Copy)]
struct Columns {
    symbol: Option<usize>,
    timestamp: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: usize,
}

impl Columns {
    fn resolve(headers: &csv::StringRecord) -> Result<Self, String> {
        let names: Vec<String> = headers
            .iter()
            .map(|h| h.trim().trim_start_matches('\u{feff}').to_lowercase())
            .collect();
        let find = |candidates: &[&str]| {
            candidates
                .iter()
                .find_map(|wanted| names.iter().position(|name| name == wanted))
        };
        let require = |candidates: &[&str]| {
            find(candidates).ok_or_else(|| {
                format!(
                    "missing OHLCV column: expected one of {}",
                    candidates.join("|")
                )
            })
        };
        Ok(Self {
            symbol: find(&["symbol", "pair", "market"]),
            timestamp: require(&TIMESTAMP_COLUMNS)?,
            open: require(&["open"])?,
            high: require(&["high"])?,
            low: require(&["low"])?,
            close: require(&["close"])?,
            volume: require(&VOLUME_COLUMNS)?,
        })
    }
}

pub fn load_csv(
    path: &Path,
    symbol: Option<&str>,
    expected_step_seconds: Option<i64>,
) -> Result<(Vec<Bar>, DataQualityReport), String> {
    let file = File::open(path)
        .map_err(|err| format!("failed to open OHLCV CSV {}: {}", path.display(), err))?;
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);
    let headers = reader
        .headers()
        .map_err(|err| format!("failed to read OHLCV header {}: {}", path.display(), err))?
        .clone();
    let columns = Columns::resolve(&headers)?;

    let mut bars = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let line = idx + 2;
        let record = row.map_err(|err| format!("failed to parse CSV row {line}: {err}"))?;
        let field = |col: usize| record.get(col).unwrap_or("");

        let row_symbol = columns.symbol.map(field).filter(|s| !s.is_empty());
        if let (Some(wanted), Some(found)) = (symbol, row_symbol) {
            if !found.eq_ignore_ascii_case(wanted) {
                continue;
            }
        }

        let number = |col: usize, name: &str| -> Result<f64, String> {
            let raw = field(col);
            raw.parse::<f64>()
                .map_err(|_| format!("row {line}: invalid {name} value '{raw}'"))
        };
        let timestamp = parse_timestamp(field(columns.timestamp))
            .map_err(|err| format!("row {line}: {err}"))?;
        bars.push(Bar {
            // A matched filter wins so case variants of the same market stay one series.
            symbol: symbol.or(row_symbol).unwrap_or(UNKNOWN_SYMBOL).to_string(),
            timestamp,
            open: number(columns.open, "open")?,
            high: number(columns.high, "high")?,
            low: number(columns.low, "low")?,
            close: number(columns.close, "close")?,
            volume: number(columns.volume, "volume")?,
        });
    }

    let report = data_quality_from_bars(&bars, expected_step_seconds);
    Ok((bars, report))
}

/// Unix seconds from epoch seconds, epoch milliseconds, RFC 3339 or a UTC `YYYY-MM-DD[ HH:MM:SS]`.
pub fn parse_timestamp(value: &str) -> Result<i64, String> {
    let value = value.trim();
    if let Ok(epoch) = value.parse::<i64>() {
        return Ok(if epoch.abs() >= EPOCH_MILLIS_THRESHOLD {
            epoch.div_euclid(1_000)
        } else {
            epoch
        });
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.timestamp());
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%z") {
        return Ok(dt.timestamp());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Utc.from_utc_datetime(&naive).timestamp());
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(Utc.from_utc_datetime(&midnight).timestamp());
    }

    Err(format!("unsupported timestamp format: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_tmp_path(name: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("vantage_{name}_{}_{}", std::process::id(), now))
    }

    fn load(
        csv_data: &str,
        symbol: Option<&str>,
        step: Option<i64>,
    ) -> (Vec<Bar>, DataQualityReport) {
        let path = unique_tmp_path("ohlcv.csv");
        fs::write(&path, csv_data).expect("write csv");
        let loaded = CsvOhlcvRepository::new()
            .load_ohlcv(&OhlcvQuery {
                source: path.clone(),
                symbol: symbol.map(str::to_string),
                expected_step_seconds: step,
            })
            .expect("load csv");
        let _ = fs::remove_file(path);
        loaded
    }

    #[test]
    fn parses_supported_timestamp_formats() {
        assert_eq!(parse_timestamp("1700000000").expect("secs"), 1_700_000_000);
        assert_eq!(parse_timestamp("1700000000123").expect("ms"), 1_700_000_000);
        assert_eq!(parse_timestamp("2026-01-01T00:01:00Z").expect("rfc3339"), 1_767_225_660);
        assert_eq!(
            parse_timestamp("2026-01-01 00:01:00+0000").expect("offset"),
            1_767_225_660
        );
        assert_eq!(parse_timestamp("2026-01-01 00:01:00").expect("naive"), 1_767_225_660);
        assert_eq!(parse_timestamp("2026-01-01").expect("date"), 1_767_225_600);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn keeps_file_order_and_reports_quality_issues() {
        let (bars, report) = load(
            "timestamp_utc,open,high,low,close,volume\n\
2026-01-01T00:00:00Z,1,1,1,1,1\n\
2026-01-01T00:00:00Z,1,1,1,1,1\n\
2026-01-01T00:03:00Z,1,1,1,1,1\n\
2026-01-01T00:02:00Z,1,1,1,1,1\n",
            Some("BTC_USDT"),
            Some(60),
        );
        assert_eq!(bars.len(), 4);
        assert_eq!(
            bars.iter().map(|b| b.timestamp % 3600).collect::<Vec<_>>(),
            vec![0, 0, 180, 120]
        );
        assert!(bars.iter().all(|b| b.symbol == "BTC_USDT"));
        assert_eq!(report.rows, 4);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.out_of_order, 1);
        assert!(report.gaps >= 1);
        assert!(report.has_fatal_issues());
    }

    #[test]
    fn symbol_column_filters_rows() {
        let (bars, report) = load(
            "symbol,timestamp,open,high,low,close,volume\n\
BTC_USDT,60,10,11,9,10.5,3\n\
ETH_USDT,60,1,1,1,1,1\n\
btc_usdt,120,10.5,12,10,11,4\n",
            Some("BTC_USDT"),
            Some(60),
        );
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].close, 11.0);
        assert_eq!(bars[1].symbol, "BTC_USDT");
        assert_eq!(report.rows, 2);
        assert_eq!(report.symbols, 1);
        assert!(!report.has_fatal_issues());

        let (all, _) = load(
            "symbol,timestamp,open,high,low,close,volume\nBTC_USDT,60,1,1,1,1,1\nETH_USDT,60,1,1,1,1,1\n",
            None,
            None,
        );
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].symbol, "ETH_USDT");
    }

    #[test]
    fn column_aliases_and_epoch_millis_are_accepted() {
        let (bars, _) = load(
            "Time,Open,High,Low,Close,Vol\n1700000000000,1,2,0.5,1.5,7\n",
            None,
            None,
        );
        assert_eq!(bars[0].timestamp, 1_700_000_000);
        assert_eq!(bars[0].volume, 7.0);
        assert_eq!(bars[0].symbol, UNKNOWN_SYMBOL);
    }

    #[test]
    fn malformed_rows_name_the_line() {
        let path = unique_tmp_path("bad_ohlcv.csv");
        fs::write(
            &path,
            "timestamp,open,high,low,close,volume\n60,1,1,1,1,1\n120,1,abc,1,1,1\n",
        )
        .expect("write csv");
        let err = load_csv(&path, None, None).expect_err("bad high");
        assert!(err.contains("row 3"), "{err}");
        assert!(err.contains("high"), "{err}");

        fs::write(&path, "timestamp,open,high,low,close\n60,1,1,1,1\n").expect("write csv");
        let err = load_csv(&path, None, None).expect_err("no volume");
        assert!(err.contains("missing OHLCV column"), "{err}");
        let _ = fs::remove_file(path);
    }

    #[test]
    fn invalid_bars_are_loaded_and_counted() {
        let (bars, report) = load(
            "timestamp,open,high,low,close,volume\n60,10,9,11,10,1\n120,10,11,9,NaN,0\n",
            None,
            Some(60),
        );
        assert_eq!(bars.len(), 2);
        assert_eq!(report.invalid_bars, 2);
        assert_eq!(report.first_invalid, Some(60));
    }
}
