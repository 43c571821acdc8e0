use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

/// Per-provider call tallies for one wall-clock minute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateWindow {
    pub provider: String,
    pub window_start: DateTime<Utc>,
    pub request_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub rate_limit_hit_count: i64,
    pub total_latency_ms: i64,
    #[serde(default)]
    pub min_latency_ms: Option<i64>,
    #[serde(default)]
    pub max_latency_ms: Option<i64>,
}

impl RateWindow {
    pub fn new(provider: impl Into<String>, window_start: DateTime<Utc>) -> Self {
        Self {
            provider: provider.into(),
            window_start,
            request_count: 0,
            success_count: 0,
            error_count: 0,
            rate_limit_hit_count: 0,
            total_latency_ms: 0,
            min_latency_ms: None,
            max_latency_ms: None,
        }
    }

    /// Tally one finished call.
    pub fn record(&mut self, latency_ms: i64, is_error: bool, is_rate_limited: bool) {
        self.request_count += 1;
        if is_error {
            self.error_count += 1;
        } else {
            self.success_count += 1;
        }
        if is_rate_limited {
            self.rate_limit_hit_count += 1;
        }
        self.total_latency_ms += latency_ms;
        self.min_latency_ms = Some(self.min_latency_ms.map_or(latency_ms, |m| m.min(latency_ms)));
        self.max_latency_ms = Some(self.max_latency_ms.map_or(latency_ms, |m| m.max(latency_ms)));
    }

    /// Fold another tally of the same window into this one.
    pub fn merge(&mut self, other: &RateWindow) {
        self.request_count += other.request_count;
        self.success_count += other.success_count;
        self.error_count += other.error_count;
        self.rate_limit_hit_count += other.rate_limit_hit_count;
        self.total_latency_ms += other.total_latency_ms;
        self.min_latency_ms = match (self.min_latency_ms, other.min_latency_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_latency_ms = match (self.max_latency_ms, other.max_latency_ms) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.request_count as f64
        }
    }
}

/// Floor a timestamp to the start of its minute.
pub fn minute_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::minutes(1)).unwrap_or(ts)
}
