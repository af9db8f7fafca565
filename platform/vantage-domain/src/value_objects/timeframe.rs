#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeframe {
    pub label: String,
    pub step_seconds: i64,
}

impl Timeframe {
    pub fn parse(value: &str) -> Result<Self, String> {
        let normalized = value.trim().to_lowercase();
        let label = match normalized.as_str() {
            "1m" | "1min" => "1min",
            "5m" | "5min" => "5min",
            "10m" | "10min" => "10min",
            "15m" | "15min" => "15min",
            "30m" | "30min" => "30min",
            "1h" | "1hour" => "1hour",
            "2h" | "2hour" => "2hour",
            "4h" | "4hour" => "4hour",
            "6h" | "6hour" => "6hour",
            "12h" | "12hour" => "12hour",
            "1d" | "1day" => "1day",
            "3d" | "3day" => "3day",
            "1w" | "1week" => "1week",
            _ => return Err(format!("unsupported timeframe: {value}")),
        };

        let step_seconds = parse_duration_like_seconds(label)?;
        Ok(Self {
            label: label.to_string(),
            step_seconds,
        })
    }

    /// Exchange interval name used by the candles endpoint (e.g. `MINUTE_1`, `HOUR_4`).
    pub fn exchange_interval(&self) -> &'static str {
        match self.step_seconds {
            60 => "MINUTE_1",
            300 => "MINUTE_5",
            600 => "MINUTE_10",
            900 => "MINUTE_15",
            1800 => "MINUTE_30",
            3600 => "HOUR_1",
            7200 => "HOUR_2",
            14400 => "HOUR_4",
            21600 => "HOUR_6",
            43200 => "HOUR_12",
            86400 => "DAY_1",
            259200 => "DAY_3",
            _ => "WEEK_1",
        }
    }

    /// Number of bars spanning `seconds`, at least one.
    pub fn bars_in(&self, seconds: i64) -> u64 {
        if self.step_seconds <= 0 {
            return 1;
        }
        (seconds / self.step_seconds).max(1) as u64
    }
}

pub fn parse_duration_like_seconds(value: &str) -> Result<i64, String> {
    let trimmed = value.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(seconds) = trimmed.parse::<i64>() {
        return Ok(seconds);
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number_part, unit) = trimmed.split_at(split);

    let multiplier = match unit {
        "s" | "sec" => 1,
        "m" | "min" => 60,
        "h" | "hour" => 3600,
        "d" | "day" => 86400,
        "w" | "week" => 604800,
        _ => return Err(format!("unsupported duration unit: {unit}")),
    };

    let number: i64 = number_part
        .parse()
        .map_err(|_| format!("invalid duration: {value}"))?;
    Ok(number * multiplier)
}

#[cfg(test)]
mod tests {
    use super::{parse_duration_like_seconds, Timeframe};

    #[test]
    fn parses_units() {
        assert_eq!(parse_duration_like_seconds("90").expect("secs"), 90);
        assert_eq!(parse_duration_like_seconds("15m").expect("min"), 900);
        assert_eq!(parse_duration_like_seconds("8h").expect("hours"), 28_800);
        assert_eq!(parse_duration_like_seconds("1day").expect("day"), 86_400);
        assert!(parse_duration_like_seconds("3x").is_err());
    }

    #[test]
    fn funding_interval_in_bars() {
        let tf = Timeframe::parse("1h").expect("timeframe");
        assert_eq!(tf.bars_in(8 * 3600), 8);
        assert_eq!(tf.exchange_interval(), "HOUR_1");
        let daily = Timeframe::parse("1d").expect("timeframe");
        assert_eq!(daily.bars_in(8 * 3600), 1);
    }
}
