use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use fg_config::RateLimitSettings;
use fg_types::{minute_floor, RateWindow};

use crate::store::MetricsStore;

/// Smallest delay handed out once usage crosses the throttle threshold.
const MIN_DELAY_MS: u64 = 250;

/// How long flushed windows stay mirrored in memory.
const FLUSHED_RETENTION_MINUTES: i64 = 2;

/// Unflushable windows older than this are discarded.
const PENDING_RETENTION_MINUTES: i64 = 15;

/// Pre-call verdict for one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ThrottleDecision {
    /// Skip the call entirely and degrade.
    pub should_throttle: bool,
    /// Sleep `delay_ms` before calling.
    pub should_delay: bool,
    pub delay_ms: u64,
    pub usage_percent: f64,
}

/// Traffic over the current and previous minute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateStats {
    pub provider: String,
    /// Sliding-window estimate of requests in the trailing 60 s.
    pub requests_last_minute: f64,
    pub requests: i64,
    pub errors: i64,
    pub rate_limit_hits: i64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: Option<i64>,
    pub max_latency_ms: Option<i64>,
}

type WindowKey = (String, DateTime<Utc>);

#[derive(Default)]
struct GovernorInner {
    /// Recorded since the last flush.
    pending: HashMap<WindowKey, RateWindow>,
    /// Handed to the store by a flush that has not finished yet.
    in_transit: HashMap<WindowKey, RateWindow>,
    /// Already persisted; kept so reads see the whole minute.
    flushed: HashMap<WindowKey, RateWindow>,
    /// Most recent rate-limit response per provider.
    last_rate_limit: HashMap<String, DateTime<Utc>>,
}

impl GovernorInner {
    fn view(&self, provider: &str, start: DateTime<Utc>) -> RateWindow {
        let key = (provider.to_string(), start);
        let mut window = RateWindow::new(provider, start);
        for map in [&self.flushed, &self.in_transit, &self.pending] {
            if let Some(w) = map.get(&key) {
                window.merge(w);
            }
        }
        window
    }

    fn note_rate_limit(&mut self, provider: &str, at: DateTime<Utc>) {
        let last = self.last_rate_limit.entry(provider.to_string()).or_insert(at);
        if at > *last {
            *last = at;
        }
    }

    fn rate_limited_within_minute(&self, provider: &str, now: DateTime<Utc>) -> bool {
        self.last_rate_limit
            .get(provider)
            .is_some_and(|at| now - *at < chrono::Duration::minutes(1))
    }
}

/// Per-provider request volume tracker that decides whether to delay or
/// refuse calls before they are attempted.
pub struct RateGovernor {
    store: Option<Arc<dyn MetricsStore>>,
    inner: Mutex<GovernorInner>,
    /// Serializes flushes so `in_transit` holds a single batch.
    flushing: Mutex<()>,
}

impl RateGovernor {
    pub fn new(store: Arc<dyn MetricsStore>) -> Self {
        Self {
            store: Some(store),
            inner: Mutex::new(GovernorInner::default()),
            flushing: Mutex::new(()),
        }
    }

    /// A governor that keeps windows in memory only.
    pub fn in_memory() -> Self {
        Self {
            store: None,
            inner: Mutex::new(GovernorInner::default()),
            flushing: Mutex::new(()),
        }
    }

    pub async fn track_request(
        &self,
        provider: &str,
        latency: Duration,
        is_error: bool,
        is_rate_limited: bool,
    ) {
        self.track_request_at(provider, latency, is_error, is_rate_limited, Utc::now())
            .await;
    }

    pub async fn track_request_at(
        &self,
        provider: &str,
        latency: Duration,
        is_error: bool,
        is_rate_limited: bool,
        at: DateTime<Utc>,
    ) {
        let start = minute_floor(at);
        let latency_ms = i64::try_from(latency.as_millis()).unwrap_or(i64::MAX);

        let mut inner = self.inner.lock().await;
        inner
            .pending
            .entry((provider.to_string(), start))
            .or_insert_with(|| RateWindow::new(provider, start))
            .record(latency_ms, is_error, is_rate_limited);
        if is_rate_limited {
            inner.note_rate_limit(provider, at);
        }
    }

    pub async fn should_throttle(&self, provider: &str, limits: &RateLimitSettings) -> ThrottleDecision {
        self.should_throttle_at(provider, limits, Utc::now()).await
    }

    pub async fn should_throttle_at(
        &self,
        provider: &str,
        limits: &RateLimitSettings,
        now: DateTime<Utc>,
    ) -> ThrottleDecision {
        let (current, previous, recently_limited) = {
            let inner = self.inner.lock().await;
            let (current, previous) = windows_around(&inner, provider, now);
            (current, previous, inner.rate_limited_within_minute(provider, now))
        };
        let estimate = sliding_estimate(&current, &previous, now);
        let decision = decide(estimate, recently_limited, limits);

        if decision.should_throttle {
            warn!(
                provider,
                usage_percent = decision.usage_percent,
                "Rate governor refusing call"
            );
        } else if decision.should_delay {
            debug!(
                provider,
                usage_percent = decision.usage_percent,
                delay_ms = decision.delay_ms,
                "Rate governor delaying call"
            );
        }
        decision
    }

    /// Persist everything recorded since the last flush. Windows that fail to
    /// persist stay buffered for the next attempt. Windows being written stay
    /// visible to reads until they land in `flushed` or back in `pending`.
    /// Returns the number of windows written.
    pub async fn flush(&self) -> usize {
        let _flushing = self.flushing.lock().await;

        let batch: Vec<WindowKey> = {
            let mut inner = self.inner.lock().await;
            let drained: Vec<_> = inner.pending.drain().collect();
            let keys = drained.iter().map(|(k, _)| k.clone()).collect();
            inner.in_transit.extend(drained);
            keys
        };

        let mut written = 0;
        for key in batch {
            let window = {
                let inner = self.inner.lock().await;
                match inner.in_transit.get(&key) {
                    Some(w) => w.clone(),
                    None => continue,
                }
            };
            let persisted = match &self.store {
                Some(store) => match store.accumulate_window(&window).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(provider = %window.provider, error = %e, "Failed to flush rate window");
                        false
                    }
                },
                None => true,
            };

            let mut inner = self.inner.lock().await;
            inner.in_transit.remove(&key);
            let target = if persisted {
                written += 1;
                &mut inner.flushed
            } else {
                &mut inner.pending
            };
            target
                .entry(key)
                .or_insert_with(|| RateWindow::new(&window.provider, window.window_start))
                .merge(&window);
        }

        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let flushed_cutoff = minute_floor(now) - chrono::Duration::minutes(FLUSHED_RETENTION_MINUTES);
        inner.flushed.retain(|(_, start), _| *start >= flushed_cutoff);
        let pending_cutoff = minute_floor(now) - chrono::Duration::minutes(PENDING_RETENTION_MINUTES);
        let before = inner.pending.len();
        inner.pending.retain(|(_, start), _| *start >= pending_cutoff);
        if inner.pending.len() < before {
            warn!(discarded = before - inner.pending.len(), "Discarded stale unflushed rate windows");
        }

        if written > 0 {
            debug!(windows = written, "Rate windows flushed");
        }
        written
    }

    /// Seed the in-memory view with recently persisted windows, e.g. after a
    /// restart.
    pub async fn warm_up(&self, provider: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let since = minute_floor(Utc::now()) - chrono::Duration::minutes(1);
        match store.recent_windows(provider, since).await {
            Ok(windows) => {
                let mut inner = self.inner.lock().await;
                for w in windows {
                    if w.rate_limit_hit_count > 0 {
                        inner.note_rate_limit(provider, w.window_start);
                    }
                    inner.flushed.insert((w.provider.clone(), w.window_start), w);
                }
            }
            Err(e) => warn!(provider, error = %e, "Failed to load recent rate windows"),
        }
    }

    pub async fn stats(&self, provider: &str) -> RateStats {
        let now = Utc::now();
        let (current, previous) = {
            let inner = self.inner.lock().await;
            windows_around(&inner, provider, now)
        };
        let estimate = sliding_estimate(&current, &previous, now);

        let mut both = current;
        both.merge(&previous);
        RateStats {
            provider: provider.to_string(),
            requests_last_minute: estimate,
            requests: both.request_count,
            errors: both.error_count,
            rate_limit_hits: both.rate_limit_hit_count,
            error_rate: if both.request_count > 0 {
                both.error_count as f64 / both.request_count as f64
            } else {
                0.0
            },
            avg_latency_ms: both.avg_latency_ms(),
            min_latency_ms: both.min_latency_ms,
            max_latency_ms: both.max_latency_ms,
        }
    }

}

/// The minute containing `now` and the one before it.
fn windows_around(inner: &GovernorInner, provider: &str, now: DateTime<Utc>) -> (RateWindow, RateWindow) {
    let current_start = minute_floor(now);
    let previous_start = current_start - chrono::Duration::minutes(1);
    (
        inner.view(provider, current_start),
        inner.view(provider, previous_start),
    )
}

/// Current minute plus the share of the previous minute still inside the
/// trailing 60 s.
fn sliding_estimate(current: &RateWindow, previous: &RateWindow, now: DateTime<Utc>) -> f64 {
    let elapsed_ms = (now - current.window_start).num_milliseconds().clamp(0, 60_000);
    let previous_weight = 1.0 - elapsed_ms as f64 / 60_000.0;
    current.request_count as f64 + previous.request_count as f64 * previous_weight
}

fn decide(estimate: f64, recently_limited: bool, limits: &RateLimitSettings) -> ThrottleDecision {
    if limits.max_requests_per_minute == 0 {
        return ThrottleDecision::default();
    }

    let usage = estimate * 100.0 / f64::from(limits.max_requests_per_minute);
    let mut decision = ThrottleDecision {
        usage_percent: usage,
        ..Default::default()
    };

    if usage >= limits.critical_percent {
        decision.should_throttle = true;
        decision.delay_ms = limits.max_delay_ms;
        return decision;
    }

    if usage >= limits.throttle_percent {
        let span = (limits.critical_percent - limits.throttle_percent).max(f64::EPSILON);
        let fraction = ((usage - limits.throttle_percent) / span).clamp(0.0, 1.0);
        let proportional = (fraction * limits.max_delay_ms as f64).ceil() as u64;
        decision.should_delay = true;
        decision.delay_ms = proportional.max(MIN_DELAY_MS).min(limits.max_delay_ms);
    }

    if recently_limited {
        decision.should_delay = true;
        decision.delay_ms = decision.delay_ms.max(limits.rate_limit_delay_ms);
    }

    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FailingStore;
    use chrono::TimeZone;
    use fg_db::Database;

    const P: &str = "anthropic";

    fn limits() -> RateLimitSettings {
        RateLimitSettings {
            max_requests_per_minute: 50,
            ..RateLimitSettings::default()
        }
    }

    fn minute() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap()
    }

    async fn fill(gov: &RateGovernor, n: usize, at: DateTime<Utc>) {
        for _ in 0..n {
            gov.track_request_at(P, Duration::from_millis(100), false, false, at)
                .await;
        }
    }

    #[tokio::test]
    async fn below_threshold_no_action() {
        let gov = RateGovernor::in_memory();
        fill(&gov, 30, minute()).await;

        let d = gov.should_throttle_at(P, &limits(), minute()).await;
        assert!(!d.should_throttle);
        assert!(!d.should_delay);
        assert_eq!(d.delay_ms, 0);
        assert!((d.usage_percent - 60.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn between_thresholds_delays_proportionally() {
        let gov = RateGovernor::in_memory();
        fill(&gov, 40, minute()).await;

        // 80% sits halfway between 70 and 90.
        let d = gov.should_throttle_at(P, &limits(), minute()).await;
        assert!(!d.should_throttle);
        assert!(d.should_delay);
        assert_eq!(d.delay_ms, 2500);
    }

    #[tokio::test]
    async fn exactly_critical_throttles() {
        let gov = RateGovernor::in_memory();
        fill(&gov, 45, minute()).await;

        let d = gov.should_throttle_at(P, &limits(), minute()).await;
        assert!(d.should_throttle);
        assert!((d.usage_percent - 90.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn above_critical_caps_delay() {
        let gov = RateGovernor::in_memory();
        fill(&gov, 48, minute()).await;

        let d = gov.should_throttle_at(P, &limits(), minute()).await;
        assert!(d.should_throttle);
        assert_eq!(d.delay_ms, 5000);
    }

    #[tokio::test]
    async fn previous_minute_weighted_by_overlap() {
        let gov = RateGovernor::in_memory();
        let prev = minute() - chrono::Duration::minutes(1);
        fill(&gov, 40, prev).await;

        // 15 s into the minute: 75% of the previous window still counts.
        let now = minute() + chrono::Duration::seconds(15);
        let d = gov.should_throttle_at(P, &limits(), now).await;
        assert!((d.usage_percent - 60.0).abs() < 1e-9);

        // Two minutes later nothing is left.
        let later = minute() + chrono::Duration::minutes(1);
        let d = gov.should_throttle_at(P, &limits(), later).await;
        assert_eq!(d.usage_percent, 0.0);
    }

    #[tokio::test]
    async fn rate_limit_hit_forces_delay() {
        let gov = RateGovernor::in_memory();
        gov.track_request_at(P, Duration::from_millis(50), true, true, minute())
            .await;

        let d = gov.should_throttle_at(P, &limits(), minute()).await;
        assert!(!d.should_throttle);
        assert!(d.should_delay);
        assert_eq!(d.delay_ms, 2000);
    }

    #[tokio::test]
    async fn rate_limit_delay_expires_after_a_minute() {
        let gov = RateGovernor::in_memory();
        let hit = minute() + chrono::Duration::seconds(5);
        gov.track_request_at(P, Duration::from_millis(50), true, true, hit)
            .await;

        let d = gov
            .should_throttle_at(P, &limits(), hit + chrono::Duration::seconds(50))
            .await;
        assert_eq!(d.delay_ms, 2000);

        // Still inside the previous window's overlap, but the hit is over a minute old.
        let d = gov
            .should_throttle_at(P, &limits(), hit + chrono::Duration::seconds(61))
            .await;
        assert!(!d.should_delay);
        assert_eq!(d.delay_ms, 0);
    }

    #[tokio::test]
    async fn zero_budget_means_unlimited() {
        let gov = RateGovernor::in_memory();
        fill(&gov, 500, minute()).await;
        let unlimited = RateLimitSettings {
            max_requests_per_minute: 0,
            ..limits()
        };
        assert_eq!(
            gov.should_throttle_at(P, &unlimited, minute()).await,
            ThrottleDecision::default()
        );
    }

    #[tokio::test]
    async fn providers_are_tracked_separately() {
        let gov = RateGovernor::in_memory();
        fill(&gov, 45, minute()).await;
        let d = gov.should_throttle_at("openai", &limits(), minute()).await;
        assert_eq!(d.usage_percent, 0.0);
    }

    #[tokio::test]
    async fn flush_persists_and_keeps_view() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.initialize().await.unwrap();
        let gov = RateGovernor::new(db.clone());

        let now = Utc::now();
        gov.track_request_at(P, Duration::from_millis(100), false, false, now).await;
        gov.track_request_at(P, Duration::from_millis(300), true, false, now).await;
        assert_eq!(gov.flush().await, 1);

        let persisted = db.recent_windows(P, minute_floor(now)).await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].request_count, 2);

        // Reads still include the flushed requests, and nothing is written twice.
        let stats = gov.stats(P).await;
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.errors, 1);
        assert!((stats.avg_latency_ms - 200.0).abs() < 1e-9);
        assert_eq!(gov.flush().await, 0);
    }

    /// Accepts writes after a fixed delay.
    struct SlowStore(Duration);

    #[async_trait::async_trait]
    impl MetricsStore for SlowStore {
        async fn accumulate_window(&self, _window: &RateWindow) -> fg_types::Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }

        async fn recent_windows(
            &self,
            _provider: &str,
            _since: DateTime<Utc>,
        ) -> fg_types::Result<Vec<RateWindow>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_stays_visible_while_flush_is_in_flight() {
        let gov = Arc::new(RateGovernor::new(Arc::new(SlowStore(Duration::from_millis(200)))));
        let now = Utc::now();
        fill(&gov, 48, now).await;
        assert!(gov.should_throttle_at(P, &limits(), now).await.should_throttle);

        let flushing = {
            let gov = gov.clone();
            tokio::spawn(async move { gov.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let d = gov.should_throttle_at(P, &limits(), now).await;
        assert!(d.should_throttle);
        assert!((d.usage_percent - 96.0).abs() < 1e-9);

        assert_eq!(flushing.await.unwrap(), 1);
        let d = gov.should_throttle_at(P, &limits(), now).await;
        assert!((d.usage_percent - 96.0).abs() < 1e-9);
        assert_eq!(gov.flush().await, 0);
    }

    #[tokio::test]
    async fn failed_flush_keeps_windows_pending() {
        let gov = RateGovernor::new(Arc::new(FailingStore));
        let now = Utc::now();
        fill(&gov, 3, now).await;

        assert_eq!(gov.flush().await, 0);
        assert_eq!(gov.stats(P).await.requests, 3);

        // Store errors never reach the caller.
        gov.warm_up(P).await;
        assert_eq!(gov.stats(P).await.requests, 3);
    }

    #[tokio::test]
    async fn warm_up_restores_persisted_windows() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.initialize().await.unwrap();

        let first = RateGovernor::new(db.clone());
        fill(&first, 5, Utc::now()).await;
        first.flush().await;

        let restarted = RateGovernor::new(db.clone());
        assert_eq!(restarted.stats(P).await.requests, 0);
        restarted.warm_up(P).await;
        assert_eq!(restarted.stats(P).await.requests, 5);
    }
}
