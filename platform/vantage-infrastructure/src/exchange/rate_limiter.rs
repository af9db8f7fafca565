use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Float slack when comparing refilled tokens against a whole token.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Orders,
    Account,
    MarketData,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 3] = [
        EndpointClass::Orders,
        EndpointClass::Account,
        EndpointClass::MarketData,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EndpointClass::Orders => "orders",
            EndpointClass::Account => "account",
            EndpointClass::MarketData => "market_data",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RateLimitError {
    #[error("rate limit bucket {class}: capacity must be >= 1 (got {capacity})")]
    InvalidCapacity { class: &'static str, capacity: f64 },
    #[error("rate limit bucket {class}: refill_per_sec must be > 0 (got {refill_per_sec})")]
    InvalidRefill {
        class: &'static str,
        refill_per_sec: f64,
    },
    #[error("unknown rate limit tier: {0} (expected standard|vip)")]
    UnknownTier(String),
}

impl BucketSpec {
    pub fn validate(&self, class: EndpointClass) -> Result<(), RateLimitError> {
        if !self.capacity.is_finite() || self.capacity < 1.0 {
            return Err(RateLimitError::InvalidCapacity {
                class: class.as_str(),
                capacity: self.capacity,
            });
        }
        if !self.refill_per_sec.is_finite() || self.refill_per_sec <= 0.0 {
            return Err(RateLimitError::InvalidRefill {
                class: class.as_str(),
                refill_per_sec: self.refill_per_sec,
            });
        }
        Ok(())
    }
}

/// Account tier presets (requests per second, burst equal to one second of traffic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitTier {
    #[default]
    Standard,
    Vip,
}

impl RateLimitTier {
    pub fn parse(value: &str) -> Result<Self, RateLimitError> {
        match value.trim().to_lowercase().as_str() {
            "standard" => Ok(RateLimitTier::Standard),
            "vip" => Ok(RateLimitTier::Vip),
            other => Err(RateLimitError::UnknownTier(other.to_string())),
        }
    }

    pub fn spec(self, class: EndpointClass) -> BucketSpec {
        let per_sec = match (self, class) {
            (RateLimitTier::Standard, EndpointClass::Orders) => 50.0,
            (RateLimitTier::Standard, EndpointClass::Account) => 10.0,
            (RateLimitTier::Standard, EndpointClass::MarketData) => 200.0,
            (RateLimitTier::Vip, EndpointClass::Orders) => 100.0,
            (RateLimitTier::Vip, EndpointClass::Account) => 50.0,
            (RateLimitTier::Vip, EndpointClass::MarketData) => 400.0,
        };
        BucketSpec {
            capacity: per_sec,
            refill_per_sec: per_sec,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    spec: BucketSpec,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(spec: BucketSpec, now: Instant) -> Self {
        Self {
            spec,
            tokens: spec.capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.spec.refill_per_sec).min(self.spec.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    /// Rounded up to whole nanoseconds and never zero, so a waiter always lets the clock move.
    fn time_to_next_token(&self) -> Duration {
        let secs = (1.0 - self.tokens).max(0.0) / self.spec.refill_per_sec;
        Duration::from_nanos((secs * 1e9).ceil().max(1.0) as u64)
    }
}

/// Token buckets per endpoint class. Each bucket is behind its own fair mutex, held across the
/// wait, so waiters on one class are served in arrival order and never block other classes.
#[derive(Debug)]
pub struct RateLimiter {
    orders: Mutex<Bucket>,
    account: Mutex<Bucket>,
    market_data: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(tier: RateLimitTier) -> Self {
        let now = Instant::now();
        Self {
            orders: Mutex::new(Bucket::new(tier.spec(EndpointClass::Orders), now)),
            account: Mutex::new(Bucket::new(tier.spec(EndpointClass::Account), now)),
            market_data: Mutex::new(Bucket::new(tier.spec(EndpointClass::MarketData), now)),
        }
    }

    /// Tier presets with per-class replacements.
    pub fn with_overrides(
        tier: RateLimitTier,
        overrides: &[(EndpointClass, BucketSpec)],
    ) -> Result<Self, RateLimitError> {
        let now = Instant::now();
        let mut specs = EndpointClass::ALL.map(|class| (class, tier.spec(class)));
        for (class, spec) in overrides {
            spec.validate(*class)?;
            for entry in specs.iter_mut() {
                if entry.0 == *class {
                    entry.1 = *spec;
                }
            }
        }
        let [(_, orders), (_, account), (_, market_data)] = specs;
        Ok(Self {
            orders: Mutex::new(Bucket::new(orders, now)),
            account: Mutex::new(Bucket::new(account, now)),
            market_data: Mutex::new(Bucket::new(market_data, now)),
        })
    }

    fn bucket(&self, class: EndpointClass) -> &Mutex<Bucket> {
        match class {
            EndpointClass::Orders => &self.orders,
            EndpointClass::Account => &self.account,
            EndpointClass::MarketData => &self.market_data,
        }
    }

    /// Takes one token, waiting for the refill when the bucket is empty. Returns the total time
    /// spent waiting, including the wait for earlier callers on the same class.
    pub async fn acquire(&self, class: EndpointClass) -> Duration {
        let start = Instant::now();
        let mut bucket = self.bucket(class).lock().await;
        loop {
            bucket.refill(Instant::now());
            if bucket.try_take() {
                break;
            }
            let wait = bucket.time_to_next_token();
            tracing::debug!(
                class = class.as_str(),
                wait_ms = wait.as_millis() as u64,
                "rate limit bucket empty"
            );
            tokio::time::sleep(wait).await;
        }
        drop(bucket);

        let waited = start.elapsed();
        metrics::counter!("vantage.exchange.rate_limit.acquired_total", "class" => class.as_str())
            .increment(1);
        if !waited.is_zero() {
            metrics::histogram!("vantage.exchange.rate_limit.wait_ms", "class" => class.as_str())
                .record(waited.as_secs_f64() * 1_000.0);
        }
        waited
    }

    /// Takes a token only if one is available right now and no caller is queued on the class.
    pub fn try_acquire(&self, class: EndpointClass) -> bool {
        match self.bucket(class).try_lock() {
            Ok(mut bucket) => {
                bucket.refill(Instant::now());
                bucket.try_take()
            }
            Err(_) => false,
        }
    }

    /// Tokens currently available; 0 while a caller is waiting on the class.
    pub fn available(&self, class: EndpointClass) -> f64 {
        match self.bucket(class).try_lock() {
            Ok(mut bucket) => {
                bucket.refill(Instant::now());
                bucket.tokens
            }
            Err(_) => 0.0,
        }
    }
}
