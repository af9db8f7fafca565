pub mod audit;
pub mod engine;
pub mod market_data_source;
pub mod ohlcv;
pub mod strategy;
