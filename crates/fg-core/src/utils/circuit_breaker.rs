use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fg_config::CircuitBreakerSettings;
use fg_types::{CircuitState, FlowgateError};

/// Point-in-time view of one provider's breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStatus {
    pub provider: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    /// Remaining wait before an OPEN circuit admits a probe.
    pub time_until_half_open: Option<Duration>,
}

#[derive(Debug, Default)]
struct CircuitRecord {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_attempts_used: u32,
    last_failure_at: Option<Instant>,
}

struct RegistryInner {
    records: HashMap<String, CircuitRecord>,
    overrides: HashMap<String, CircuitBreakerSettings>,
}

/// Per-provider circuit breakers for fault tolerance.
///
/// The OPEN to HALF_OPEN transition happens lazily inside `can_proceed`;
/// there is no background timer.
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerSettings,
    inner: Mutex<RegistryInner>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerSettings) -> Self {
        Self {
            defaults,
            inner: Mutex::new(RegistryInner {
                records: HashMap::new(),
                overrides: HashMap::new(),
            }),
        }
    }

    /// Use explicit settings for one provider instead of the defaults.
    pub async fn configure(&self, provider: &str, settings: CircuitBreakerSettings) {
        self.inner
            .lock()
            .await
            .overrides
            .insert(provider.to_string(), settings);
    }

    /// Whether a call may be attempted now. In HALF_OPEN a `true` answer
    /// consumes a probe slot.
    pub async fn can_proceed(&self, provider: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let settings = settings_for(&inner.overrides, &self.defaults, provider);
        let record = inner.records.entry(provider.to_string()).or_default();

        match record.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed_enough = record
                    .last_failure_at
                    .map_or(true, |at| at.elapsed() >= settings.reset_timeout);
                if !elapsed_enough {
                    return false;
                }
                record.state = CircuitState::HalfOpen;
                record.half_open_successes = 0;
                record.half_open_attempts_used = 1;
                info!(provider, "Circuit breaker entering HALF_OPEN state");
                true
            }
            CircuitState::HalfOpen => {
                if record.half_open_attempts_used < settings.half_open_max_requests {
                    record.half_open_attempts_used += 1;
                    true
                } else {
                    debug!(provider, "Circuit breaker probe slots exhausted");
                    false
                }
            }
        }
    }

    pub async fn record_success(&self, provider: &str) {
        let mut inner = self.inner.lock().await;
        let settings = settings_for(&inner.overrides, &self.defaults, provider);
        let record = inner.records.entry(provider.to_string()).or_default();

        match record.state {
            CircuitState::Closed => record.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                record.half_open_successes += 1;
                record.half_open_attempts_used = record.half_open_attempts_used.saturating_sub(1);
                if record.half_open_successes >= settings.success_threshold {
                    *record = CircuitRecord::default();
                    info!(provider, "Circuit breaker closing after successful probes");
                }
            }
            // A straggler from before the circuit opened.
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self, provider: &str) {
        let mut inner = self.inner.lock().await;
        let settings = settings_for(&inner.overrides, &self.defaults, provider);
        let record = inner.records.entry(provider.to_string()).or_default();
        record.last_failure_at = Some(Instant::now());

        match record.state {
            CircuitState::Closed => {
                record.consecutive_failures += 1;
                if record.consecutive_failures >= settings.failure_threshold {
                    record.state = CircuitState::Open;
                    warn!(
                        provider,
                        failures = record.consecutive_failures,
                        "Circuit breaker opening"
                    );
                }
            }
            CircuitState::HalfOpen => {
                record.state = CircuitState::Open;
                record.half_open_successes = 0;
                record.half_open_attempts_used = 0;
                warn!(provider, "Circuit breaker probe failed, reopening");
            }
            CircuitState::Open => {}
        }
    }

    /// Give back a probe slot without counting an outcome, for attempts that
    /// ended in an error that says nothing about provider health.
    pub async fn release_probe(&self, provider: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.records.get_mut(provider) {
            if record.state == CircuitState::HalfOpen {
                record.half_open_attempts_used = record.half_open_attempts_used.saturating_sub(1);
            }
        }
    }

    pub async fn get_state(&self, provider: &str) -> CircuitStatus {
        let inner = self.inner.lock().await;
        let settings = settings_for(&inner.overrides, &self.defaults, provider);
        match inner.records.get(provider) {
            Some(record) => status_of(provider, record, &settings),
            None => status_of(provider, &CircuitRecord::default(), &settings),
        }
    }

    /// Status of every provider seen so far, sorted by name.
    pub async fn snapshot(&self) -> Vec<CircuitStatus> {
        let inner = self.inner.lock().await;
        let mut all: Vec<CircuitStatus> = inner
            .records
            .iter()
            .map(|(provider, record)| {
                let settings = settings_for(&inner.overrides, &self.defaults, provider);
                status_of(provider, record, &settings)
            })
            .collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }

    /// Force a provider back to CLOSED.
    pub async fn reset(&self, provider: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.records.get_mut(provider) {
            *record = CircuitRecord::default();
            info!(provider, "Circuit breaker reset");
        }
    }

    /// Run `f` under the breaker, counting every error as a provider failure.
    pub async fn call<F, Fut, T, E>(&self, provider: &str, f: F) -> Result<T, FlowgateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<FlowgateError>,
    {
        if !self.can_proceed(provider).await {
            return Err(FlowgateError::CircuitBreakerOpen(provider.to_string()));
        }

        match f().await {
            Ok(result) => {
                self.record_success(provider).await;
                Ok(result)
            }
            Err(e) => {
                self.record_failure(provider).await;
                Err(e.into())
            }
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerSettings::default())
    }
}

fn settings_for(
    overrides: &HashMap<String, CircuitBreakerSettings>,
    defaults: &CircuitBreakerSettings,
    provider: &str,
) -> CircuitBreakerSettings {
    overrides.get(provider).unwrap_or(defaults).clone()
}

fn status_of(
    provider: &str,
    record: &CircuitRecord,
    settings: &CircuitBreakerSettings,
) -> CircuitStatus {
    let time_until_half_open = match (record.state, record.last_failure_at) {
        (CircuitState::Open, Some(at)) => Some(settings.reset_timeout.saturating_sub(at.elapsed())),
        (CircuitState::Open, None) => Some(Duration::ZERO),
        _ => None,
    };

    CircuitStatus {
        provider: provider.to_string(),
        state: record.state,
        failures: record.consecutive_failures,
        successes: record.half_open_successes,
        time_until_half_open,
    }
}
