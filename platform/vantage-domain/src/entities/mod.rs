pub mod catalog;
pub mod metrics;
pub mod portfolio;
pub mod risk;
