use crate::exchange::error::ExchangeError;
use crate::exchange::gateway::ExchangeGateway;
use crate::exchange::rate_limiter::EndpointClass;
use crate::exchange::rest::{PoloniexRestClient, MAX_CANDLES_LIMIT};
use crate::exchange::retry::{CallContext, CancelToken};
use chrono::Utc;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use vantage_domain::value_objects::bar::Bar;
use vantage_domain::value_objects::timeframe::Timeframe;

const DEFAULT_WARMUP_BARS: u32 = 1;

/// Polls the candles endpoint and emits each closed candle exactly once, oldest first.
pub struct CandlePoller {
    gateway: Arc<ExchangeGateway>,
    client: Arc<PoloniexRestClient>,
    symbol: String,
    interval: &'static str,
    step_seconds: i64,
    poll_interval: Duration,
    call_timeout: Option<Duration>,
    warmup_bars: u32,
    last_emitted: Option<i64>,
}

impl CandlePoller {
    pub fn new(
        gateway: Arc<ExchangeGateway>,
        client: Arc<PoloniexRestClient>,
        symbol: &str,
        timeframe: &Timeframe,
        poll_interval: Duration,
    ) -> Self {
        Self {
            gateway,
            client,
            symbol: symbol.to_string(),
            interval: timeframe.exchange_interval(),
            step_seconds: timeframe.step_seconds,
            poll_interval,
            call_timeout: None,
            warmup_bars: DEFAULT_WARMUP_BARS,
            last_emitted: None,
        }
    }

    /// Deadline applied to each poll, retries included.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Closed candles emitted on the first poll.
    pub fn with_warmup_bars(mut self, bars: u32) -> Self {
        self.warmup_bars = bars.max(1);
        self
    }

    pub fn last_emitted(&self) -> Option<i64> {
        self.last_emitted
    }

    fn request_limit(&self, now_secs: i64) -> u32 {
        let wanted = match self.last_emitted {
            // One extra row for the candle still forming.
            None => i64::from(self.warmup_bars) + 1,
            Some(last) => (now_secs - last) / self.step_seconds.max(1) + 2,
        };
        wanted.clamp(2, i64::from(MAX_CANDLES_LIMIT)) as u32
    }

    pub async fn poll_once(
        &mut self,
        ctx: &CallContext,
        now_secs: i64,
    ) -> Result<Vec<Bar>, ExchangeError> {
        let limit = self.request_limit(now_secs);
        let client = self.client.as_ref();
        let symbol = self.symbol.as_str();
        let interval = self.interval;
        let candles = self
            .gateway
            .call(EndpointClass::MarketData, ctx, move || {
                client.candles(symbol, interval, limit)
            })
            .await?;

        let mut fresh = select_new_closed(candles, self.last_emitted, self.step_seconds, now_secs);
        if self.last_emitted.is_none() && fresh.len() > self.warmup_bars as usize {
            fresh.drain(..fresh.len() - self.warmup_bars as usize);
        }
        if let Some(last) = fresh.last() {
            self.last_emitted = Some(last.timestamp);
        }
        Ok(fresh)
    }

    /// Polls until cancelled or until the receiving side hangs up. Transient failures that outlast
    /// the retry policy are logged and the next poll tries again; anything else ends the feed.
    /// Returns the number of bars sent.
    pub async fn run(self, tx: Sender<Bar>, cancel: CancelToken) -> Result<u64, ExchangeError> {
        let span = tracing::info_span!(
            "candle_feed",
            symbol = %self.symbol,
            interval = self.interval
        );
        self.poll_loop(tx, cancel).instrument(span).await
    }

    async fn poll_loop(
        mut self,
        tx: Sender<Bar>,
        cancel: CancelToken,
    ) -> Result<u64, ExchangeError> {
        let mut sent = 0u64;
        loop {
            let mut ctx = CallContext::new().with_cancel(cancel.clone());
            if let Some(timeout) = self.call_timeout {
                ctx = ctx.with_timeout(timeout);
            }

            match self.poll_once(&ctx, Utc::now().timestamp()).await {
                Ok(bars) => {
                    for bar in bars {
                        tracing::debug!(
                            timestamp = bar.timestamp,
                            close = bar.close,
                            "candle closed"
                        );
                        if tx.send(bar).is_err() {
                            tracing::info!(sent, "feed receiver dropped");
                            return Ok(sent);
                        }
                        sent += 1;
                        metrics::counter!("vantage.feed.bars_total").increment(1);
                    }
                }
                Err(ExchangeError::Cancelled) => break,
                Err(err) if is_recoverable(&err) => {
                    metrics::counter!(
                        "vantage.feed.poll_errors_total",
                        "kind" => err.kind().as_str()
                    )
                    .increment(1);
                    tracing::warn!(error = %err, "candle poll failed; waiting for next poll");
                }
                Err(err) => {
                    tracing::error!(error = %err, "candle feed stopped");
                    return Err(err);
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        tracing::info!(sent, "candle feed cancelled");
        Ok(sent)
    }
}

fn is_recoverable(err: &ExchangeError) -> bool {
    match err {
        ExchangeError::RetriesExhausted { last, .. } => last.is_retryable(),
        ExchangeError::DeadlineExceeded { .. } => true,
        other => other.is_retryable(),
    }
}

/// Candles whose interval has ended by `now_secs` and that are newer than `last_emitted`.
pub fn select_new_closed(
    candles: Vec<Bar>,
    last_emitted: Option<i64>,
    step_seconds: i64,
    now_secs: i64,
) -> Vec<Bar> {
    let mut fresh: Vec<Bar> = candles
        .into_iter()
        .filter(|bar| bar.timestamp + step_seconds <= now_secs)
        .filter(|bar| !matches!(last_emitted, Some(last) if bar.timestamp <= last))
        .collect();
    fresh.sort_by_key(|bar| bar.timestamp);
    fresh.dedup_by_key(|bar| bar.timestamp);
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::rate_limiter::{RateLimitTier, RateLimiter};
    use crate::exchange::retry::RetryPolicy;
    use serde_json::json;
    use std::sync::mpsc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn bar(ts: i64) -> Bar {
        Bar {
            symbol: "BTC_USDT".to_string(),
            timestamp: ts,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 3.0,
        }
    }

    fn candles_body(starts: &[i64]) -> String {
        let rows: Vec<_> = starts
            .iter()
            .map(|ts| {
                json!([
                    "99", "101", "100", "100.5", "300", "3", "0", "0", 1, 0, "0", "0",
                    ts * 1_000, ts * 1_000 + 59_999
                ])
            })
            .collect();
        serde_json::Value::Array(rows).to_string()
    }

    /// Answers every request with the same status and body.
    async fn fake_exchange(
        status: &'static str,
        body: String,
    ) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), handle)
    }

    fn poller(base: &str, poll_interval: Duration) -> CandlePoller {
        let gateway = ExchangeGateway::new(
            Arc::new(RateLimiter::new(RateLimitTier::Standard)),
            RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
            },
        );
        let client = PoloniexRestClient::new(base, Duration::from_secs(5)).expect("client");
        CandlePoller::new(
            Arc::new(gateway),
            Arc::new(client),
            "BTC_USDT",
            &Timeframe::parse("1m").expect("timeframe"),
            poll_interval,
        )
    }

    #[test]
    fn forming_and_already_emitted_candles_are_skipped() {
        let candles = vec![bar(120), bar(0), bar(60), bar(180)];
        let fresh = select_new_closed(candles.clone(), None, 60, 185);
        let stamps: Vec<i64> = fresh.iter().map(|b| b.timestamp).collect();
        assert_eq!(stamps, vec![0, 60, 120]);

        let fresh = select_new_closed(candles.clone(), Some(120), 60, 240);
        let stamps: Vec<i64> = fresh.iter().map(|b| b.timestamp).collect();
        assert_eq!(stamps, vec![180]);

        assert!(select_new_closed(candles, Some(120), 60, 239).is_empty());
    }

    #[test]
    fn request_limit_covers_missed_polls() {
        let mut poller = poller("http://127.0.0.1:9", Duration::from_secs(1)).with_warmup_bars(5);
        assert_eq!(poller.request_limit(1_000), 6);
        poller.last_emitted = Some(600);
        assert_eq!(poller.request_limit(900), 7);
        poller.last_emitted = Some(0);
        assert_eq!(poller.request_limit(10_000_000), MAX_CANDLES_LIMIT);
    }

    #[tokio::test]
    async fn poll_once_emits_each_closed_candle_once() {
        let (base, server) = fake_exchange("200 OK", candles_body(&[0, 60, 120, 180])).await;
        let mut poller = poller(&base, Duration::from_secs(1)).with_warmup_bars(2);
        let ctx = CallContext::new();

        let first = poller.poll_once(&ctx, 200).await.expect("first poll");
        let stamps: Vec<i64> = first.iter().map(|b| b.timestamp).collect();
        assert_eq!(stamps, vec![60, 120]);
        assert_eq!(poller.last_emitted(), Some(120));

        let second = poller.poll_once(&ctx, 240).await.expect("second poll");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].timestamp, 180);

        assert!(poller.poll_once(&ctx, 250).await.expect("third").is_empty());
        server.abort();
    }

    #[tokio::test]
    async fn run_forwards_bars_until_cancelled() {
        let (base, server) = fake_exchange("200 OK", candles_body(&[0, 60, 120])).await;
        let poller = poller(&base, Duration::from_millis(10)).with_warmup_bars(10);
        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let feed = tokio::spawn(poller.run(tx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        let sent = feed.await.expect("join").expect("feed");
        server.abort();

        assert_eq!(sent, 3);
        let stamps: Vec<i64> = rx.try_iter().map(|b| b.timestamp).collect();
        assert_eq!(stamps, vec![0, 60, 120]);
    }

    #[tokio::test]
    async fn run_stops_when_receiver_is_dropped() {
        let (base, server) = fake_exchange("200 OK", candles_body(&[0, 60])).await;
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let sent = poller(&base, Duration::from_millis(10))
            .run(tx, CancelToken::new())
            .await
            .expect("feed");
        server.abort();
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn auth_failure_ends_the_feed() {
        let (base, server) = fake_exchange("401 Unauthorized", "{}".to_string()).await;
        let (tx, _rx) = mpsc::channel();
        let err = poller(&base, Duration::from_millis(10))
            .run(tx, CancelToken::new())
            .await
            .expect_err("auth");
        server.abort();
        assert!(matches!(err, ExchangeError::Auth(_)));
    }

    #[tokio::test]
    async fn transient_failures_keep_the_feed_alive() {
        let (base, server) = fake_exchange("503 Service Unavailable", "{}".to_string()).await;
        let (tx, _rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let feed = tokio::spawn(poller(&base, Duration::from_millis(10)).run(tx, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!feed.is_finished());
        cancel.cancel();
        assert_eq!(feed.await.expect("join").expect("feed"), 0);
        server.abort();
    }
}
