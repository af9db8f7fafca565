use crate::exchange::error::ExchangeError;
use crate::exchange::rate_limiter::{EndpointClass, RateLimiter};
use crate::exchange::retry::{CallContext, RetryExecutor, RetryPolicy};
use std::future::Future;
use std::sync::Arc;

/// Every exchange call goes through here: each attempt first takes a rate-limit token for its
/// endpoint class, and the whole sequence runs under the retry policy.
#[derive(Debug, Clone)]
pub struct ExchangeGateway {
    limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
}

impl ExchangeGateway {
    pub fn new(limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Self {
        Self {
            limiter,
            retry: RetryExecutor::new(policy),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn call<T, F, Fut>(
        &self,
        class: EndpointClass,
        ctx: &CallContext,
        mut op: F,
    ) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let limiter = &self.limiter;
        self.retry
            .execute(ctx, || {
                let attempt = op();
                async move {
                    limiter.acquire(class).await;
                    attempt.await
                }
            })
            .await
    }
}
