use crate::services::ohlcv::DataQualityReport;
use crate::value_objects::bar::Bar;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct OhlcvQuery {
    pub source: PathBuf,
    /// Only rows for this symbol are returned; `None` keeps every symbol in the source.
    pub symbol: Option<String>,
    pub expected_step_seconds: Option<i64>,
}

pub trait MarketDataRepository {
    fn load_ohlcv(&self, query: &OhlcvQuery) -> Result<(Vec<Bar>, DataQualityReport), String>;
}
