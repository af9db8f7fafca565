pub mod error;
pub mod feed;
pub mod gateway;
pub mod rate_limiter;
pub mod rest;
pub mod retry;
