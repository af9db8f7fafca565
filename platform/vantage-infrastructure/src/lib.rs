pub mod artifacts;
pub mod catalog;
pub mod exchange;
pub mod market_data;
