use crate::exchange::error::ExchangeError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Longest wait honored from a server `Retry-After` hint.
pub const MAX_SERVER_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// `min(max_delay, base_delay * 2^attempt)`, with `attempt` counted from 0.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation shared between a caller and the calls it started.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub cancel: CancelToken,
    pub deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Retries transient failures with exponential backoff (or the server's `retry_after`).
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn execute<T, F, Fut>(&self, ctx: &CallContext, mut op: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut attempts: u32 = 0;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(ExchangeError::Cancelled);
            }
            let remaining = ctx.remaining();
            if remaining.is_some_and(|left| left.is_zero()) {
                return Err(ExchangeError::DeadlineExceeded { attempts });
            }

            attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(ExchangeError::Cancelled),
                outcome = bounded(remaining, op()) => outcome,
            };
            let err = match outcome {
                Some(Ok(value)) => return Ok(value),
                Some(Err(err)) => err,
                None => return Err(ExchangeError::DeadlineExceeded { attempts }),
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempts > self.policy.max_retries {
                metrics::counter!(
                    "vantage.exchange.retries_exhausted_total",
                    "kind" => err.kind().as_str()
                )
                .increment(1);
                return Err(ExchangeError::RetriesExhausted {
                    attempts,
                    last: Box::new(err),
                });
            }

            let delay = match err.retry_after() {
                Some(hint) if hint > MAX_SERVER_RETRY_AFTER => {
                    tracing::warn!(
                        retry_after_ms = hint.as_millis() as u64,
                        cap_ms = MAX_SERVER_RETRY_AFTER.as_millis() as u64,
                        "server retry-after above cap"
                    );
                    MAX_SERVER_RETRY_AFTER
                }
                Some(hint) => hint,
                None => self.policy.backoff_delay(attempts - 1),
            };
            if ctx.remaining().is_some_and(|left| delay >= left) {
                return Err(ExchangeError::DeadlineExceeded { attempts });
            }

            tracing::warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                kind = err.kind().as_str(),
                error = %err,
                "retrying exchange call"
            );
            metrics::counter!("vantage.exchange.retries_total", "kind" => err.kind().as_str())
                .increment(1);

            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(ExchangeError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// `None` when the attempt outlived the remaining deadline.
async fn bounded<T>(remaining: Option<Duration>, fut: impl Future<Output = T>) -> Option<T> {
    match remaining {
        Some(left) => tokio::time::timeout(left, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy(5);
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(250));
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = &AtomicU32::new(0);
        let start = Instant::now();
        let result = RetryExecutor::new(policy(3))
            .execute(&CallContext::new(), move || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(ExchangeError::Timeout),
                    1 => Err(ExchangeError::from_status(503, String::new(), None)),
                    _ => Ok(42),
                }
            })
            .await;
        assert_eq!(result.expect("success"), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_return_immediately() {
        let calls = &AtomicU32::new(0);
        let err = RetryExecutor::new(policy(3))
            .execute(&CallContext::new(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ExchangeError::Auth("bad key".to_string()))
            })
            .await
            .expect_err("auth");
        assert!(matches!(err, ExchangeError::Auth(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempts_and_last_error() {
        let calls = &AtomicU32::new(0);
        let err = RetryExecutor::new(policy(2))
            .execute(&CallContext::new(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ExchangeError::Network("reset".to_string()))
            })
            .await
            .expect_err("exhausted");
        match err {
            ExchangeError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ExchangeError::Network(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn server_retry_after_overrides_backoff() {
        let calls = &AtomicU32::new(0);
        let start = Instant::now();
        RetryExecutor::new(policy(1))
            .execute(&CallContext::new(), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ExchangeError::RateLimited {
                        retry_after: Some(Duration::from_secs(3)),
                    })
                } else {
                    Ok(())
                }
            })
            .await
            .expect("success");
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_retry_after_is_capped() {
        let calls = &AtomicU32::new(0);
        let start = Instant::now();
        RetryExecutor::new(policy(1))
            .execute(&CallContext::new(), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ExchangeError::from_status(
                        503,
                        String::new(),
                        Some(Duration::from_secs(86_400)),
                    ))
                } else {
                    Ok(())
                }
            })
            .await
            .expect("success");
        assert_eq!(start.elapsed(), MAX_SERVER_RETRY_AFTER);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_past_the_deadline_aborts_early() {
        let calls = &AtomicU32::new(0);
        let start = Instant::now();
        let ctx = CallContext::new().with_timeout(Duration::from_millis(150));
        let err = RetryExecutor::new(policy(5))
            .execute(&ctx, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ExchangeError::Timeout)
            })
            .await
            .expect_err("deadline");
        assert!(matches!(err, ExchangeError::DeadlineExceeded { attempts: 2 }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_is_bounded_by_the_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_secs(1));
        let err = RetryExecutor::new(policy(5))
            .execute(&ctx, move || async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<(), ExchangeError>(())
            })
            .await
            .expect_err("deadline");
        assert!(matches!(err, ExchangeError::DeadlineExceeded { attempts: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff_sleep() {
        let token = CancelToken::new();
        let ctx = CallContext::new().with_cancel(token.clone());
        let canceller = tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            }
        });
        let start = Instant::now();
        let err = RetryExecutor::new(RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
        })
        .execute(&ctx, move || async move { Err::<(), _>(ExchangeError::Timeout) })
        .await
        .expect_err("cancelled");
        canceller.await.expect("join");
        assert!(matches!(err, ExchangeError::Cancelled));
        assert_eq!(start.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_first_attempt() {
        let token = CancelToken::new();
        token.cancel();
        let calls = &AtomicU32::new(0);
        let err = RetryExecutor::default()
            .execute(&CallContext::new().with_cancel(token), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), ExchangeError>(())
            })
            .await
            .expect_err("cancelled");
        assert!(matches!(err, ExchangeError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }
}
