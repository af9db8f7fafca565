pub mod backtesting;
pub mod config;
pub mod experiments;
pub mod paper_trading;
pub mod reporting;
mod shared;
pub mod validation;
