use std::sync::Arc;
use std::time::Duration;
use vantage_application::config::Config;
use vantage_domain::repositories::artifacts::{ArtifactReader, ArtifactWriter};
use vantage_domain::repositories::catalog::CatalogRepository;
use vantage_domain::repositories::market_data::MarketDataRepository;
use vantage_infrastructure::artifacts::{FilesystemArtifactReader, FilesystemArtifactWriter};
use vantage_infrastructure::catalog::JsonCatalogRepository;
use vantage_infrastructure::exchange::gateway::ExchangeGateway;
use vantage_infrastructure::exchange::rate_limiter::{
    BucketSpec, EndpointClass, RateLimitTier, RateLimiter,
};
use vantage_infrastructure::exchange::rest::{PoloniexRestClient, POLONIEX_BASE};
use vantage_infrastructure::exchange::retry::RetryPolicy;
use vantage_infrastructure::market_data::CsvOhlcvRepository;

const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

pub struct EngineDeps {
    pub market_data: Box<dyn MarketDataRepository + Send + Sync>,
    pub catalog: Box<dyn CatalogRepository + Send + Sync>,
    pub artifacts: Box<dyn ArtifactWriter + Send + Sync>,
}

pub struct ExchangeDeps {
    pub gateway: Arc<ExchangeGateway>,
    pub client: Arc<PoloniexRestClient>,
    /// Deadline for one logical call, retries included.
    pub call_deadline: Option<Duration>,
}

pub fn build_engine_deps() -> EngineDeps {
    EngineDeps {
        market_data: Box::new(CsvOhlcvRepository::new()),
        catalog: Box::new(JsonCatalogRepository::new()),
        artifacts: Box::new(FilesystemArtifactWriter::new()),
    }
}

pub fn build_market_data_repo() -> Box<dyn MarketDataRepository> {
    Box::new(CsvOhlcvRepository::new())
}

pub fn build_artifact_reader() -> Box<dyn ArtifactReader> {
    Box::new(FilesystemArtifactReader::new())
}

pub fn build_rate_limiter(config: &Config) -> Result<RateLimiter, String> {
    let section = config.rate_limits.as_ref();
    let tier = match section.and_then(|limits| limits.tier.as_deref()) {
        Some(raw) => RateLimitTier::parse(raw).map_err(|err| err.to_string())?,
        None => RateLimitTier::default(),
    };

    let mut overrides = Vec::new();
    if let Some(limits) = section {
        for (class, bucket) in [
            (EndpointClass::Orders, limits.orders),
            (EndpointClass::Account, limits.account),
            (EndpointClass::MarketData, limits.market_data),
        ] {
            if let Some(bucket) = bucket {
                overrides.push((
                    class,
                    BucketSpec {
                        capacity: bucket.capacity,
                        refill_per_sec: bucket.refill_per_sec,
                    },
                ));
            }
        }
    }
    RateLimiter::with_overrides(tier, &overrides).map_err(|err| err.to_string())
}

pub fn build_retry_policy(config: &Config) -> RetryPolicy {
    let defaults = RetryPolicy::default();
    let Some(exchange) = config.exchange.as_ref() else {
        return defaults;
    };
    RetryPolicy {
        max_retries: exchange.max_retries.unwrap_or(defaults.max_retries),
        base_delay: exchange
            .base_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay),
        max_delay: exchange
            .max_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay),
    }
}

pub fn build_exchange_deps(config: &Config) -> Result<ExchangeDeps, String> {
    let exchange = config.exchange.as_ref();
    let base_url = exchange
        .and_then(|e| e.base_url.as_deref())
        .unwrap_or(POLONIEX_BASE);
    let timeout = Duration::from_millis(
        exchange
            .and_then(|e| e.timeout_ms)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS),
    );
    let client = PoloniexRestClient::new(base_url, timeout).map_err(|err| err.to_string())?;
    let limiter = build_rate_limiter(config)?;
    let policy = build_retry_policy(config);
    tracing::info!(
        base_url = client.base_url(),
        max_retries = policy.max_retries,
        "exchange gateway ready"
    );

    Ok(ExchangeDeps {
        gateway: Arc::new(ExchangeGateway::new(Arc::new(limiter), policy)),
        client: Arc::new(client),
        call_deadline: exchange
            .and_then(|e| e.call_deadline_ms)
            .map(Duration::from_millis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_application::config::parse_config;

    const MINIMAL: &str = r#"
[run]
run_id = "infra"
symbol = "BTC_USDT"
timeframe = "1m"
initial_capital = 1000.0

[data]
ohlcv_path = "data.csv"
out_dir = "runs"

[costs]
fee_bps = 5.0
slippage_bps = 1.0

[risk]
max_leverage = 5.0
max_position_pct = 0.5
daily_loss_limit_pct = 0.05
max_drawdown_pct = 0.2
"#;

    #[test]
    fn retry_policy_defaults_without_exchange_section() {
        let config = parse_config(MINIMAL).expect("config");
        assert_eq!(build_retry_policy(&config), RetryPolicy::default());
    }

    #[test]
    fn exchange_section_overrides_policy_and_buckets() {
        let toml = format!(
            "{MINIMAL}\n[exchange]\nmax_retries = 1\nbase_delay_ms = 50\ncall_deadline_ms = 2000\n\n[rate_limits]\ntier = \"vip\"\n\n[rate_limits.orders]\ncapacity = 3.0\nrefill_per_sec = 1.5\n"
        );
        let config = parse_config(&toml).expect("config");
        let policy = build_retry_policy(&config);
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.base_delay, Duration::from_millis(50));
        assert_eq!(policy.max_delay, RetryPolicy::default().max_delay);

        let limiter = build_rate_limiter(&config).expect("limiter");
        assert!((limiter.available(EndpointClass::Orders) - 3.0).abs() < 1e-9);
        assert!((limiter.available(EndpointClass::Account) - 50.0).abs() < 1e-9);

        let deps = build_exchange_deps(&config).expect("deps");
        assert_eq!(deps.call_deadline, Some(Duration::from_secs(2)));
        assert_eq!(deps.client.base_url(), POLONIEX_BASE);
    }
}
