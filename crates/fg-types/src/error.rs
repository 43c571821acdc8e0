use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// How the governance layer should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying: network blips, 5xx, 429, timeouts.
    Transient,
    /// Local capacity said no: queue full, circuit open, throttled, no key.
    CapacityExhausted,
    /// Retrying will not help.
    Terminal,
}

/// Transport-level category of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Connection,
    Timeout,
    Http,
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Http => "http",
        };
        write!(f, "{s}")
    }
}

/// Failure reported by the upstream language-model provider.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Provider-supplied "retry after" hint.
    pub retry_after: Option<Duration>,
}

impl UpstreamError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Connection,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Timeout,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Http,
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Attach the hint from a raw `Retry-After` header. Unparsable values
    /// leave the error without a hint.
    pub fn with_retry_after_header(mut self, value: &str) -> Self {
        self.retry_after = parse_retry_after(value);
        self
    }

    /// 429, or a provider message that says so.
    pub fn is_rate_limited(&self) -> bool {
        if self.status == Some(429) {
            return true;
        }
        let msg = self.message.to_lowercase();
        msg.contains("rate limit") || msg.contains("rate_limit") || msg.contains("too many requests")
    }

    pub fn is_transient(&self) -> bool {
        match self.kind {
            UpstreamErrorKind::Connection | UpstreamErrorKind::Timeout => true,
            UpstreamErrorKind::Http => {
                self.is_rate_limited() || self.status.is_some_and(|s| (500..600).contains(&s))
            }
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} error (HTTP {status}): {}", self.kind, self.message),
            None => write!(f, "{} error: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Parse a `Retry-After` header value given in (possibly fractional) seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Top-level error type for Flowgate.
#[derive(Error, Debug)]
pub enum FlowgateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Circuit breaker open for provider {0}")]
    CircuitBreakerOpen(String),

    #[error("Provider {provider} throttled at {usage_percent:.0}% of its request budget")]
    Throttled { provider: String, usage_percent: f64 },

    #[error("No credential available for provider {0}")]
    NoCredentialAvailable(String),

    #[error("Admission queue full")]
    QueueFull,

    #[error("Upstream {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl FlowgateError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Upstream(e) if e.is_transient() => ErrorClass::Transient,
            Self::Timeout(_) => ErrorClass::Transient,
            Self::CircuitBreakerOpen(_)
            | Self::Throttled { .. }
            | Self::NoCredentialAvailable(_)
            | Self::QueueFull => ErrorClass::CapacityExhausted,
            _ => ErrorClass::Terminal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Upstream(e) if e.is_rate_limited())
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Upstream(e) => e.retry_after,
            _ => None,
        }
    }
}

/// Convenience type alias.
pub type Result<T> = std::result::Result<T, FlowgateError>;
