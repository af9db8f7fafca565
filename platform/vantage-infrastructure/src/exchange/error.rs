use std::time::Duration;
use thiserror::Error;

/// Coarse classification callers switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimited,
    Server,
    Client,
    Auth,
    InsufficientBalance,
    Decode,
    InvalidRequest,
    Cancelled,
    DeadlineExceeded,
    RetriesExhausted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Server => "server",
            ErrorKind::Client => "client",
            ErrorKind::Auth => "auth",
            ErrorKind::InsufficientBalance => "insufficient_balance",
            ErrorKind::Decode => "decode",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::RetriesExhausted => "retries_exhausted",
        }
    }

    /// Transient failures: network, timeout, HTTP 429 and HTTP 5xx.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimited | ErrorKind::Server
        )
    }
}

/// Errors returned by exchange calls.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited by exchange (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("exchange server error: HTTP {status} - {message}")]
    Server {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("request rejected: HTTP {status} - {message}")]
    Client { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("malformed request: {0}")]
    InvalidRequest(String),

    #[error("call cancelled")]
    Cancelled,

    #[error("deadline exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { attempts: u32 },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ExchangeError>,
    },
}

impl ExchangeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::Network(_) => ErrorKind::Network,
            ExchangeError::Timeout => ErrorKind::Timeout,
            ExchangeError::RateLimited { .. } => ErrorKind::RateLimited,
            ExchangeError::Server { .. } => ErrorKind::Server,
            ExchangeError::Client { .. } => ErrorKind::Client,
            ExchangeError::Auth(_) => ErrorKind::Auth,
            ExchangeError::InsufficientBalance(_) => ErrorKind::InsufficientBalance,
            ExchangeError::Decode(_) => ErrorKind::Decode,
            ExchangeError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ExchangeError::Cancelled => ErrorKind::Cancelled,
            ExchangeError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            ExchangeError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Server-provided wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExchangeError::RateLimited { retry_after } => *retry_after,
            ExchangeError::Server { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Maps a non-success HTTP status and its body.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => ExchangeError::RateLimited { retry_after },
            401 | 403 => ExchangeError::Auth(body),
            500..=599 => ExchangeError::Server {
                status,
                message: body,
                retry_after,
            },
            _ if body.to_lowercase().contains("insufficient") => {
                ExchangeError::InsufficientBalance(body)
            }
            _ => ExchangeError::Client {
                status,
                message: body,
            },
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout
        } else if err.is_connect() {
            ExchangeError::Network(err.to_string())
        } else if err.is_decode() {
            ExchangeError::Decode(err.to_string())
        } else if err.is_builder() {
            ExchangeError::InvalidRequest(err.to_string())
        } else if let Some(status) = err.status() {
            ExchangeError::from_status(status.as_u16(), err.to_string(), None)
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

/// `Retry-After` in delta-seconds form. Values too large for a `Duration` are ignored.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_kinds() {
        let cases = [
            (429, "slow down", ErrorKind::RateLimited),
            (401, "bad key", ErrorKind::Auth),
            (403, "forbidden", ErrorKind::Auth),
            (500, "oops", ErrorKind::Server),
            (503, "maintenance", ErrorKind::Server),
            (400, "Insufficient balance", ErrorKind::InsufficientBalance),
            (400, "bad symbol", ErrorKind::Client),
            (404, "missing", ErrorKind::Client),
        ];
        for (status, body, kind) in cases {
            assert_eq!(
                ExchangeError::from_status(status, body.to_string(), None).kind(),
                kind,
                "status {status}"
            );
        }
    }

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(ExchangeError::Timeout.is_retryable());
        assert!(ExchangeError::Network("reset".to_string()).is_retryable());
        assert!(ExchangeError::from_status(502, String::new(), None).is_retryable());
        assert!(ExchangeError::RateLimited { retry_after: None }.is_retryable());
        assert!(!ExchangeError::Decode("eof".to_string()).is_retryable());
        assert!(!ExchangeError::Auth("bad".to_string()).is_retryable());
        assert!(!ExchangeError::from_status(422, "nope".to_string(), None).is_retryable());
        assert!(!ExchangeError::Cancelled.is_retryable());
    }

    #[test]
    fn retry_after_is_carried_from_the_response() {
        let err =
            ExchangeError::from_status(429, String::new(), parse_retry_after(Some(" 2 ")));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(Some("soon")), None);
        assert_eq!(parse_retry_after(None), None);
        assert_eq!(parse_retry_after(Some("-1")), None);
        assert_eq!(parse_retry_after(Some("NaN")), None);
        assert_eq!(parse_retry_after(Some("1e20")), None);
        assert_eq!(parse_retry_after(Some("inf")), None);
        assert_eq!(
            parse_retry_after(Some("0.5")),
            Some(Duration::from_millis(500))
        );
        assert_eq!(ExchangeError::Timeout.retry_after(), None);
    }
}
