use crate::exchange::error::{parse_retry_after, ExchangeError};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use vantage_domain::value_objects::bar::Bar;

pub const POLONIEX_BASE: &str = "https://api.poloniex.com";
/// Largest page the candles endpoint serves.
pub const MAX_CANDLES_LIMIT: u32 = 500;

// Column positions in a candles row.
const COL_LOW: usize = 0;
const COL_HIGH: usize = 1;
const COL_OPEN: usize = 2;
const COL_CLOSE: usize = 3;
const COL_QUANTITY: usize = 5;
const COL_START_TIME: usize = 12;

/// Thin public-endpoint client. Rate limiting and retries are the caller's job (see
/// `ExchangeGateway`); this only turns HTTP outcomes into `ExchangeError`s.
#[derive(Debug, Clone)]
pub struct PoloniexRestClient {
    http: Client,
    base_url: String,
}

impl PoloniexRestClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|err| ExchangeError::InvalidRequest(format!("http client: {err}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let response = self.http.get(self.build_url(path)).query(query).send().await?;
        handle_response(response).await
    }

    /// Most recent candles, oldest first.
    pub async fn candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Bar>, ExchangeError> {
        if symbol.trim().is_empty() {
            return Err(ExchangeError::InvalidRequest("symbol is empty".to_string()));
        }
        let limit = limit.clamp(1, MAX_CANDLES_LIMIT);
        let payload: Value = self
            .get_json(
                &format!("markets/{symbol}/candles"),
                &[
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        parse_candles(symbol, &payload)
    }
}

async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, ExchangeError> {
    let status = response.status();
    if status.is_success() {
        let body = response.text().await?;
        return serde_json::from_str(&body)
            .map_err(|err| ExchangeError::Decode(format!("{err} (body: {})", truncate(&body))));
    }

    let retry_after = parse_retry_after(
        response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok()),
    );
    let body = response.text().await.unwrap_or_default();
    Err(ExchangeError::from_status(
        status.as_u16(),
        truncate(&body).to_string(),
        retry_after,
    ))
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(256) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Parses a candles payload (array of arrays) into bars sorted by open time in seconds.
pub fn parse_candles(symbol: &str, payload: &Value) -> Result<Vec<Bar>, ExchangeError> {
    let rows = payload
        .as_array()
        .ok_or_else(|| ExchangeError::Decode("candles payload is not an array".to_string()))?;

    let mut bars = Vec::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        let cols = row
            .as_array()
            .ok_or_else(|| ExchangeError::Decode(format!("candle {idx} is not an array")))?;
        let number = |col: usize, name: &str| -> Result<f64, ExchangeError> {
            cols.get(col)
                .and_then(value_as_f64)
                .ok_or_else(|| ExchangeError::Decode(format!("candle {idx}: invalid {name}")))
        };
        let start_ms = number(COL_START_TIME, "startTime")?;
        bars.push(Bar {
            symbol: symbol.to_string(),
            timestamp: (start_ms as i64).div_euclid(1_000),
            open: number(COL_OPEN, "open")?,
            high: number(COL_HIGH, "high")?,
            low: number(COL_LOW, "low")?,
            close: number(COL_CLOSE, "close")?,
            volume: number(COL_QUANTITY, "quantity")?,
        });
    }
    bars.sort_by_key(|bar| bar.timestamp);
    Ok(bars)
}

fn value_as_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::error::ErrorKind;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn row(start_ms: i64, open: &str, close: &str) -> Value {
        json!([
            "99", "120", open, close, "1000.5", "10.25", "0", "0", 3, 0, "0", "0",
            start_ms, start_ms + 59_999
        ])
    }

    /// Serves one canned HTTP response and hands back the request line.
    async fn serve_once(
        status: &str,
        headers: &str,
        body: &str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n{headers}\r\n{body}",
            body.len()
        );
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.expect("read");
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf[..n])
                .lines()
                .next()
                .unwrap_or_default()
                .to_string()
        });
        (format!("http://{addr}/"), handle)
    }

    #[test]
    fn parses_rows_into_sorted_bars() {
        let payload = json!([
            row(1_700_000_060_000, "101", "102"),
            row(1_700_000_000_000, "100", "101"),
        ]);
        let bars = parse_candles("BTC_USDT", &payload).expect("parse");
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp, 1_700_000_000);
        assert_eq!(bars[0].open, 100.0);
        assert_eq!(bars[0].close, 101.0);
        assert_eq!(bars[0].high, 120.0);
        assert_eq!(bars[0].low, 99.0);
        assert_eq!(bars[0].volume, 10.25);
        assert_eq!(bars[1].timestamp, 1_700_000_060);
    }

    #[test]
    fn numeric_columns_are_accepted() {
        let payload = json!([[1.0, 2.0, 1.5, 1.8, 10, 5, 0, 0, 1, 0, 0, 0, 60_000, 119_999]]);
        let bars = parse_candles("ETH_USDT", &payload).expect("parse");
        assert_eq!(bars[0].timestamp, 60);
        assert_eq!(bars[0].volume, 5.0);
    }

    #[test]
    fn malformed_rows_are_decode_errors() {
        let err = parse_candles("BTC_USDT", &json!({"code": 500})).expect_err("object");
        assert_eq!(err.kind(), ErrorKind::Decode);
        let err = parse_candles("BTC_USDT", &json!([["1", "2"]])).expect_err("short row");
        assert!(err.to_string().contains("candle 0"));
    }

    #[tokio::test]
    async fn candles_request_hits_market_endpoint() {
        let body = json!([row(1_700_000_000_000, "100", "101")]).to_string();
        let (base, server) = serve_once("200 OK", "", &body).await;
        let client = PoloniexRestClient::new(&base, Duration::from_secs(5)).expect("client");
        let bars = client.candles("BTC_USDT", "MINUTE_1", 5).await.expect("candles");
        assert_eq!(bars.len(), 1);
        let request_line = server.await.expect("join");
        assert!(request_line.starts_with("GET /markets/BTC_USDT/candles?"));
        assert!(request_line.contains("interval=MINUTE_1"));
        assert!(request_line.contains("limit=5"));
    }

    #[tokio::test]
    async fn throttled_response_carries_retry_after() {
        let (base, server) =
            serve_once("429 Too Many Requests", "retry-after: 2\r\n", "{}").await;
        let client = PoloniexRestClient::new(&base, Duration::from_secs(5)).expect("client");
        let err = client
            .candles("BTC_USDT", "MINUTE_1", 5)
            .await
            .expect_err("throttled");
        server.await.expect("join");
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn invalid_json_body_is_decode_error() {
        let (base, server) = serve_once("200 OK", "", "not json").await;
        let client = PoloniexRestClient::new(&base, Duration::from_secs(5)).expect("client");
        let err = client
            .candles("BTC_USDT", "MINUTE_1", 5)
            .await
            .expect_err("decode");
        server.await.expect("join");
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[tokio::test]
    async fn empty_symbol_is_rejected_without_a_request() {
        let client =
            PoloniexRestClient::new(POLONIEX_BASE, Duration::from_secs(5)).expect("client");
        let err = client.candles(" ", "MINUTE_1", 5).await.expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }
}
