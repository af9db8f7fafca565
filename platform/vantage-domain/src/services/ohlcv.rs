use crate::value_objects::bar::Bar;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct DataQualityReport {
    pub rows: usize,
    pub symbols: usize,
    pub duplicates: usize,
    pub gaps: usize,
    pub out_of_order: usize,
    pub invalid_bars: usize,
    pub zero_volume: usize,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
    pub first_gap: Option<i64>,
    pub first_duplicate: Option<i64>,
    pub first_out_of_order: Option<i64>,
    pub first_invalid: Option<i64>,
    pub max_gap_seconds: Option<i64>,
}

impl DataQualityReport {
    /// Problems that make a replay abort (the engine requires strictly increasing bars per symbol).
    pub fn has_fatal_issues(&self) -> bool {
        self.duplicates > 0 || self.out_of_order > 0 || self.invalid_bars > 0
    }
}

/// Per-symbol ordering checks plus bar sanity. `expected_step_seconds` enables gap detection.
pub fn data_quality_from_bars(
    bars: &[Bar],
    expected_step_seconds: Option<i64>,
) -> DataQualityReport {
    let mut report = DataQualityReport {
        rows: bars.len(),
        ..DataQualityReport::default()
    };
    let step = expected_step_seconds.map(|s| s.max(1));
    let mut last_by_symbol: BTreeMap<&str, i64> = BTreeMap::new();

    for bar in bars {
        let ts = bar.timestamp;
        report.first_timestamp = Some(report.first_timestamp.map_or(ts, |v| v.min(ts)));
        report.last_timestamp = Some(report.last_timestamp.map_or(ts, |v| v.max(ts)));

        if bar.validate().is_err() {
            report.invalid_bars += 1;
            report.first_invalid.get_or_insert(ts);
        }
        if bar.volume == 0.0 {
            report.zero_volume += 1;
        }

        if let Some(prev) = last_by_symbol.get(bar.symbol.as_str()).copied() {
            if ts == prev {
                report.duplicates += 1;
                report.first_duplicate.get_or_insert(ts);
            } else if ts < prev {
                report.out_of_order += 1;
                report.first_out_of_order.get_or_insert(ts);
                continue;
            } else if let Some(step) = step {
                let diff = ts - prev;
                if diff > step {
                    report.gaps += 1;
                    report.first_gap.get_or_insert(ts);
                    report.max_gap_seconds =
                        Some(report.max_gap_seconds.map_or(diff, |current| current.max(diff)));
                }
            }
        }
        last_by_symbol.insert(bar.symbol.as_str(), ts);
    }

    report.symbols = last_by_symbol.len();
    report
}
