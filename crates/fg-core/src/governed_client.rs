use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fg_config::{Config, RateLimitSettings, RetrySettings};
use fg_types::{ErrorClass, FlowgateError, LlmRequest, LlmResponse, Result, SelectedKey};

use crate::key_pool::KeyPool;
use crate::provider::LlmProvider;
use crate::utils::{with_retry_hooks, CircuitBreakerRegistry, RateGovernor, RetryHooks};

/// Why a canned reply was substituted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    Throttled,
    CircuitOpen,
    NoCredential,
    QueueFull,
    UpstreamUnavailable,
}

impl DegradeReason {
    fn from_error(err: &FlowgateError) -> Self {
        match err {
            FlowgateError::Throttled { .. } => Self::Throttled,
            FlowgateError::CircuitBreakerOpen(_) => Self::CircuitOpen,
            FlowgateError::NoCredentialAvailable(_) => Self::NoCredential,
            FlowgateError::QueueFull => Self::QueueFull,
            _ => Self::UpstreamUnavailable,
        }
    }
}

impl std::fmt::Display for DegradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Throttled => "throttled",
            Self::CircuitOpen => "circuit_open",
            Self::NoCredential => "no_credential",
            Self::QueueFull => "queue_full",
            Self::UpstreamUnavailable => "upstream_unavailable",
        };
        write!(f, "{s}")
    }
}

/// Reply text plus whether it is the canned substitute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub text: String,
    pub degraded: Option<DegradeReason>,
}

/// One provider behind rate governor, circuit breaker, key rotation and
/// retry.
pub struct GovernedClient {
    provider: Arc<dyn LlmProvider>,
    breakers: Arc<CircuitBreakerRegistry>,
    keys: Arc<KeyPool>,
    rate: Arc<RateGovernor>,
    retry: RetrySettings,
    limits: RateLimitSettings,
    call_timeout: Duration,
    default_cooldown: Duration,
    degraded_response: String,
    degraded: std::sync::Mutex<HashMap<DegradeReason, u64>>,
}

impl GovernedClient {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        breakers: Arc<CircuitBreakerRegistry>,
        keys: Arc<KeyPool>,
        rate: Arc<RateGovernor>,
        config: &Config,
    ) -> Self {
        Self {
            provider,
            breakers,
            keys,
            rate,
            retry: config.retry.clone(),
            limits: config.rate.clone(),
            call_timeout: config.call_timeout,
            default_cooldown: config.keys.default_cooldown,
            degraded_response: config.degraded_response.clone(),
            degraded: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Place one governed call.
    pub async fn call(&self, request: &LlmRequest, tenant_id: Option<&str>) -> Result<LlmResponse> {
        let provider = self.provider.name();

        let decision = self.rate.should_throttle(provider, &self.limits).await;
        if decision.should_throttle {
            return Err(FlowgateError::Throttled {
                provider: provider.to_string(),
                usage_percent: decision.usage_percent,
            });
        }
        if decision.should_delay && decision.delay_ms > 0 {
            debug!(provider, delay_ms = decision.delay_ms, "Delaying call");
            tokio::time::sleep(Duration::from_millis(decision.delay_ms)).await;
        }

        if !self.breakers.can_proceed(provider).await {
            return Err(FlowgateError::CircuitBreakerOpen(provider.to_string()));
        }

        let key = match self.keys.get_available_key(provider, tenant_id).await {
            Some(key) if !key.on_cooldown => key,
            _ => {
                self.breakers.release_probe(provider).await;
                return Err(FlowgateError::NoCredentialAvailable(provider.to_string()));
            }
        };
        debug!(provider, key = %key.id, tier = %key.tier, "Credential selected");

        let current = Arc::new(Mutex::new(key));
        let mut hooks = CallHooks {
            keys: &self.keys,
            provider,
            tenant_id,
            current: current.clone(),
        };

        with_retry_hooks(&self.retry, provider, &mut hooks, move |attempt| {
            self.attempt(request, attempt, current.clone())
        })
        .await
    }

    /// Like [`call`](Self::call), but answers with the configured canned
    /// reply when the call should not or could not be placed. Terminal
    /// errors are still returned.
    pub async fn call_or_degrade(&self, request: &LlmRequest, tenant_id: Option<&str>) -> Result<Reply> {
        match self.call(request, tenant_id).await {
            Ok(response) => Ok(Reply {
                text: response.text,
                degraded: None,
            }),
            Err(e) if e.class() == ErrorClass::Terminal => Err(e),
            Err(e) => {
                let reason = DegradeReason::from_error(&e);
                info!(provider = self.provider.name(), reason = %reason, error = %e, "Degrading reply");
                Ok(self.degrade(reason))
            }
        }
    }

    /// Canned reply for `reason`, counted like any other degradation.
    pub fn degrade(&self, reason: DegradeReason) -> Reply {
        if let Ok(mut counts) = self.degraded.lock() {
            *counts.entry(reason).or_default() += 1;
        }
        Reply {
            text: self.degraded_response.clone(),
            degraded: Some(reason),
        }
    }

    /// Degraded replies served so far, by reason.
    pub fn degraded_counts(&self) -> HashMap<DegradeReason, u64> {
        self.degraded
            .lock()
            .map(|counts| counts.clone())
            .unwrap_or_default()
    }

    async fn attempt(
        &self,
        request: &LlmRequest,
        attempt: u32,
        current: Arc<Mutex<SelectedKey>>,
    ) -> Result<LlmResponse> {
        let provider = self.provider.name();
        if attempt > 1 && !self.breakers.can_proceed(provider).await {
            return Err(FlowgateError::CircuitBreakerOpen(provider.to_string()));
        }

        let key = current.lock().await.clone();
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.call_timeout, self.provider.invoke(request, &key.secret)).await;
        let latency = started.elapsed();

        match outcome {
            Ok(Ok(response)) => {
                self.rate.track_request(provider, latency, false, false).await;
                self.breakers.record_success(provider).await;
                Ok(response)
            }
            Ok(Err(e)) => {
                let rate_limited = e.is_rate_limited();
                self.rate.track_request(provider, latency, true, rate_limited).await;
                if e.is_transient() {
                    self.breakers.record_failure(provider).await;
                } else {
                    self.breakers.release_probe(provider).await;
                }
                if rate_limited {
                    let cooldown = e.retry_after.unwrap_or(self.default_cooldown);
                    self.keys.mark_rate_limited(&key.id, cooldown).await;
                }
                debug!(provider, attempt, key = %key.id, error = %e, "Upstream call failed");
                Err(e.into())
            }
            Err(_) => {
                self.rate.track_request(provider, latency, true, false).await;
                self.breakers.record_failure(provider).await;
                Err(FlowgateError::Timeout(format!(
                    "{provider} call exceeded {}ms",
                    self.call_timeout.as_millis()
                )))
            }
        }
    }
}

/// Rotates the credential between attempts after a rate-limit failure.
/// The failed key is already cooling by the time this runs.
struct CallHooks<'a> {
    keys: &'a KeyPool,
    provider: &'a str,
    tenant_id: Option<&'a str>,
    current: Arc<Mutex<SelectedKey>>,
}

#[async_trait]
impl<'a> RetryHooks<FlowgateError> for CallHooks<'a> {
    async fn on_rate_limit(&mut self, _err: &FlowgateError) -> Result<()> {
        let used = self.current.lock().await.id.clone();

        match self.keys.get_available_key(self.provider, self.tenant_id).await {
            Some(next) if !next.on_cooldown => {
                debug!(provider = self.provider, from = %used, to = %next.id, "Rotating credential");
                *self.current.lock().await = next;
                Ok(())
            }
            _ => {
                warn!(provider = self.provider, key = %used, "No fresh credential after rate limit");
                Err(FlowgateError::NoCredentialAvailable(self.provider.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fg_config::{CircuitBreakerSettings, KeyPoolSettings};
    use fg_db::{Database, KeyRepository};
    use fg_types::{ApiKey, ChatMessage, CircuitState, UpstreamError};
    use std::sync::Mutex as StdMutex;

    const P: &str = "scripted";

    /// Replays a fixed list of outcomes and records which key each call used.
    struct Scripted {
        outcomes: StdMutex<Vec<std::result::Result<&'static str, UpstreamError>>>,
        keys_used: StdMutex<Vec<String>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<std::result::Result<&'static str, UpstreamError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: StdMutex::new(outcomes.into_iter().rev().collect()),
                keys_used: StdMutex::new(Vec::new()),
            })
        }

        fn keys_used(&self) -> Vec<String> {
            self.keys_used.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn name(&self) -> &str {
            P
        }

        async fn invoke(
            &self,
            _request: &LlmRequest,
            api_key: &str,
        ) -> std::result::Result<LlmResponse, UpstreamError> {
            self.keys_used.lock().unwrap().push(api_key.to_string());
            let next = self.outcomes.lock().unwrap().pop().unwrap_or(Ok("default"));
            next.map(|text| LlmResponse {
                text: text.to_string(),
            })
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.retry = RetrySettings {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(50),
            jitter_percent: 0.0,
        };
        config.circuit = CircuitBreakerSettings {
            failure_threshold: 3,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(60),
            half_open_max_requests: 1,
        };
        config.degraded_response = "We'll get back to you shortly.".to_string();
        config
    }

    fn request() -> LlmRequest {
        LlmRequest {
            messages: vec![ChatMessage::user("hello")],
            model: "test-model".to_string(),
            streaming: false,
        }
    }

    async fn build(
        provider: Arc<Scripted>,
        keys: &[(&str, u32)],
        fallback: Option<&str>,
    ) -> (GovernedClient, Arc<CircuitBreakerRegistry>, Arc<KeyPool>) {
        build_with(config(), provider, keys, fallback).await
    }

    async fn build_with(
        config: Config,
        provider: Arc<Scripted>,
        keys: &[(&str, u32)],
        fallback: Option<&str>,
    ) -> (GovernedClient, Arc<CircuitBreakerRegistry>, Arc<KeyPool>) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.initialize().await.unwrap();
        for (id, priority) in keys {
            KeyRepository::new(&db)
                .upsert_key(&ApiKey::new(*id, P, format!("sk-{id}"), *priority))
                .await
                .unwrap();
        }

        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit.clone()));
        let pool = Arc::new(KeyPool::new(
            db.clone(),
            KeyPoolSettings {
                fallback_api_key: fallback.map(str::to_string),
                ..config.keys.clone()
            },
        ));
        let rate = Arc::new(RateGovernor::in_memory());
        let client = GovernedClient::new(provider, breakers.clone(), pool.clone(), rate, &config);
        (client, breakers, pool)
    }

    #[tokio::test]
    async fn success_passes_through() {
        let provider = Scripted::new(vec![Ok("hi there")]);
        let (client, _, _) = build(provider.clone(), &[("k1", 0)], None).await;

        let response = client.call(&request(), None).await.unwrap();
        assert_eq!(response.text, "hi there");
        assert_eq!(provider.keys_used(), vec!["sk-k1"]);
    }

    #[tokio::test]
    async fn rate_limit_rotates_credential() {
        let provider = Scripted::new(vec![
            Err(UpstreamError::http(429, "slow down")),
            Ok("second key worked"),
        ]);
        let (client, _, pool) = build(provider.clone(), &[("a", 0), ("b", 0)], None).await;

        let response = client.call(&request(), None).await.unwrap();
        assert_eq!(response.text, "second key worked");

        let used = provider.keys_used();
        assert_eq!(used.len(), 2);
        assert_ne!(used[0], used[1]);

        let cooling: Vec<_> = pool
            .pool_status(P)
            .await
            .into_iter()
            .filter(|s| s.cooldown_remaining.is_some())
            .collect();
        assert_eq!(cooling.len(), 1);
    }

    #[tokio::test]
    async fn final_rate_limit_still_cools_the_key() {
        let limited = || -> std::result::Result<&'static str, UpstreamError> {
            Err(UpstreamError::http(429, "slow down"))
        };
        let provider = Scripted::new(vec![limited(), limited(), limited(), limited()]);
        let mut config = config();
        config.retry.max_attempts = 2;
        config.rate.rate_limit_delay_ms = 0;
        let (client, _, pool) =
            build_with(config, provider.clone(), &[("a", 0), ("b", 0)], None).await;

        let err = client.call(&request(), None).await.unwrap_err();
        assert!(err.is_rate_limited());
        let used = provider.keys_used();
        assert_eq!(used.len(), 2);
        assert_ne!(used[0], used[1]);

        let status = pool.pool_status(P).await;
        assert_eq!(status.len(), 2);
        assert!(status.iter().all(|s| s.cooldown_remaining.is_some()));

        // Both keys are cooling, so the next call is refused without reaching upstream.
        let reply = client.call_or_degrade(&request(), None).await.unwrap();
        assert_eq!(reply.degraded, Some(DegradeReason::NoCredential));
        assert_eq!(provider.keys_used().len(), 2);
    }

    #[tokio::test]
    async fn rate_limit_without_fresh_key_stops_retrying() {
        let provider = Scripted::new(vec![
            Err(UpstreamError::http(429, "slow down")),
            Ok("should not be reached"),
        ]);
        let (client, _, pool) = build(provider.clone(), &[("only", 0)], None).await;

        let err = client.call(&request(), None).await.unwrap_err();
        assert!(matches!(err, FlowgateError::NoCredentialAvailable(_)));
        assert_eq!(err.class(), ErrorClass::CapacityExhausted);
        assert_eq!(provider.keys_used(), vec!["sk-only"]);

        let status = pool.pool_status(P).await;
        assert!(status[0].cooldown_remaining.is_some());
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let provider = Scripted::new(vec![Err(UpstreamError::http(400, "bad request"))]);
        let (client, breakers, _) = build(provider.clone(), &[("k1", 0)], None).await;

        let err = client.call(&request(), None).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Terminal);
        assert_eq!(provider.keys_used().len(), 1);
        assert_eq!(breakers.get_state(P).await.failures, 0);

        // Terminal errors are not swallowed by the degrade path.
        let provider = Scripted::new(vec![Err(UpstreamError::http(401, "unauthorized"))]);
        let (client, _, _) = build(provider, &[("k1", 0)], None).await;
        assert!(client.call_or_degrade(&request(), None).await.is_err());
    }

    #[tokio::test]
    async fn exhausted_transient_failures_open_circuit_and_degrade() {
        let provider = Scripted::new(vec![
            Err(UpstreamError::http(503, "down")),
            Err(UpstreamError::connection("reset")),
            Err(UpstreamError::http(502, "bad gateway")),
        ]);
        let (client, breakers, _) = build(provider.clone(), &[("k1", 0)], None).await;

        let reply = client.call_or_degrade(&request(), None).await.unwrap();
        assert_eq!(reply.degraded, Some(DegradeReason::UpstreamUnavailable));
        assert_eq!(reply.text, "We'll get back to you shortly.");
        assert_eq!(breakers.get_state(P).await.state, CircuitState::Open);

        let reply = client.call_or_degrade(&request(), None).await.unwrap();
        assert_eq!(reply.degraded, Some(DegradeReason::CircuitOpen));
        assert_eq!(provider.keys_used().len(), 3);

        let counts = client.degraded_counts();
        assert_eq!(counts[&DegradeReason::UpstreamUnavailable], 1);
        assert_eq!(counts[&DegradeReason::CircuitOpen], 1);
    }

    #[tokio::test]
    async fn missing_credential_degrades() {
        let provider = Scripted::new(vec![]);
        let (client, _, _) = build(provider.clone(), &[], None).await;

        let err = client.call(&request(), None).await.unwrap_err();
        assert!(matches!(err, FlowgateError::NoCredentialAvailable(_)));

        let reply = client.call_or_degrade(&request(), None).await.unwrap();
        assert_eq!(reply.degraded, Some(DegradeReason::NoCredential));
        assert!(provider.keys_used().is_empty());
    }

    #[tokio::test]
    async fn cooling_fallback_is_not_called() {
        let provider = Scripted::new(vec![]);
        let (client, _, pool) = build(provider.clone(), &[], Some("sk-fallback")).await;

        assert_eq!(client.call(&request(), None).await.unwrap().text, "default");
        assert_eq!(provider.keys_used(), vec!["sk-fallback"]);

        pool.mark_rate_limited(&fg_types::KeyId::Fallback, Duration::from_secs(60))
            .await;
        let reply = client.call_or_degrade(&request(), None).await.unwrap();
        assert_eq!(reply.degraded, Some(DegradeReason::NoCredential));
        assert_eq!(provider.keys_used().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        struct Hanging;

        #[async_trait]
        impl LlmProvider for Hanging {
            fn name(&self) -> &str {
                P
            }

            async fn invoke(
                &self,
                _request: &LlmRequest,
                _api_key: &str,
            ) -> std::result::Result<LlmResponse, UpstreamError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(LlmResponse {
                    text: "late".to_string(),
                })
            }
        }

        let mut config = config();
        config.call_timeout = Duration::from_millis(100);
        let pool = Arc::new(KeyPool::new(
            Arc::new(crate::store::testing::FailingStore),
            KeyPoolSettings {
                fallback_api_key: Some("sk-fallback".to_string()),
                ..KeyPoolSettings::default()
            },
        ));
        let client = GovernedClient::new(
            Arc::new(Hanging),
            Arc::new(CircuitBreakerRegistry::new(config.circuit.clone())),
            pool,
            Arc::new(RateGovernor::in_memory()),
            &config,
        );

        let err = client.call(&request(), None).await.unwrap_err();
        assert!(matches!(err, FlowgateError::Timeout(_)));
    }
}
