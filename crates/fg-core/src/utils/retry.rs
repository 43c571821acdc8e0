use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{error, warn};

use fg_config::RetrySettings;
use fg_types::FlowgateError;

/// Failure classification consulted between attempts.
pub trait RetryableError: std::fmt::Display {
    fn is_transient(&self) -> bool;

    fn is_rate_limited(&self) -> bool {
        false
    }

    /// Provider-supplied wait before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RetryableError for FlowgateError {
    fn is_transient(&self) -> bool {
        FlowgateError::is_transient(self)
    }

    fn is_rate_limited(&self) -> bool {
        FlowgateError::is_rate_limited(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        FlowgateError::retry_after(self)
    }
}

/// Callbacks invoked between attempts.
#[async_trait]
pub trait RetryHooks<E: RetryableError + Send + Sync>: Send {
    fn should_retry(&self, err: &E) -> bool {
        err.is_transient()
    }

    /// Called before sleeping ahead of attempt `attempt + 1`.
    async fn on_retry(&mut self, _attempt: u32, _err: &E, _delay: Duration) {}

    /// Called on a rate-limit failure, before the next attempt. An error
    /// stops retrying and is returned in place of the rate-limit failure.
    async fn on_rate_limit(&mut self, _err: &E) -> Result<(), E> {
        Ok(())
    }
}

/// Hooks that keep the default classification and do nothing else.
pub struct NoHooks;

impl<E: RetryableError + Send + Sync> RetryHooks<E> for NoHooks {}

/// Execute an async operation with exponential backoff retry.
pub async fn with_retry<F, Fut, T, E>(settings: &RetrySettings, name: &str, f: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Send + Sync,
{
    with_retry_hooks(settings, name, &mut NoHooks, f).await
}

/// Like [`with_retry`], with caller-supplied classification and callbacks.
///
/// The operation receives the 1-based attempt number. A retry-after hint on
/// the error is slept exactly; otherwise the backoff delay is jittered and
/// capped at `max_delay`.
pub async fn with_retry_hooks<F, Fut, T, E, H>(
    settings: &RetrySettings,
    name: &str,
    hooks: &mut H,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Send + Sync,
    H: RetryHooks<E> + ?Sized,
{
    let max_attempts = settings.max_attempts.max(1);
    let mut current_delay = settings.initial_delay;
    let mut attempt = 1;

    loop {
        let err = match f(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !hooks.should_retry(&err) {
            return Err(err);
        }
        if attempt >= max_attempts {
            error!("Function {name} failed after {max_attempts} attempts: {err}");
            return Err(err);
        }

        if err.is_rate_limited() {
            if let Err(stop) = hooks.on_rate_limit(&err).await {
                warn!("Function {name} stopped retrying after rate limit: {stop}");
                return Err(stop);
            }
        }

        let delay = match err.retry_after() {
            Some(hint) => hint,
            None => {
                let delay = jittered(current_delay, settings.jitter_percent).min(settings.max_delay);
                current_delay = grow(current_delay, settings.backoff_multiplier, settings.max_delay);
                delay
            }
        };

        warn!(
            "Function {name} failed (attempt {attempt}/{max_attempts}) retrying in {:.1}s: {err}",
            delay.as_secs_f64()
        );
        hooks.on_retry(attempt, &err, delay).await;

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Spread `delay` uniformly over `±jitter_percent`.
fn jittered(delay: Duration, jitter_percent: f64) -> Duration {
    let spread = (jitter_percent / 100.0).clamp(0.0, 1.0);
    if spread == 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

fn grow(delay: Duration, multiplier: f64, cap: Duration) -> Duration {
    let next = delay.as_secs_f64() * multiplier.max(1.0);
    Duration::from_secs_f64(next.min(cap.as_secs_f64()))
}
