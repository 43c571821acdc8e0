use chrono::{DateTime, Utc};

use fg_types::{FlowgateError, RateWindow, Result};

use crate::connection::{from_db_time, to_db_time, Database};

/// Repository for per-minute rate windows.
pub struct RateMetricsRepository<'a> {
    db: &'a Database,
}

impl<'a> RateMetricsRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Add a buffered window's tallies to the stored row for the same minute.
    pub async fn accumulate_window(&self, window: &RateWindow) -> Result<()> {
        sqlx::query(
            "INSERT INTO rate_metrics
                (provider, window_start, request_count, success_count, error_count,
                 rate_limit_hit_count, total_latency_ms, min_latency_ms, max_latency_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(provider, window_start) DO UPDATE SET
                request_count = request_count + excluded.request_count,
                success_count = success_count + excluded.success_count,
                error_count = error_count + excluded.error_count,
                rate_limit_hit_count = rate_limit_hit_count + excluded.rate_limit_hit_count,
                total_latency_ms = total_latency_ms + excluded.total_latency_ms,
                min_latency_ms = CASE
                    WHEN min_latency_ms IS NULL THEN excluded.min_latency_ms
                    WHEN excluded.min_latency_ms IS NULL THEN min_latency_ms
                    ELSE MIN(min_latency_ms, excluded.min_latency_ms) END,
                max_latency_ms = CASE
                    WHEN max_latency_ms IS NULL THEN excluded.max_latency_ms
                    WHEN excluded.max_latency_ms IS NULL THEN max_latency_ms
                    ELSE MAX(max_latency_ms, excluded.max_latency_ms) END",
        )
        .bind(&window.provider)
        .bind(to_db_time(window.window_start))
        .bind(window.request_count)
        .bind(window.success_count)
        .bind(window.error_count)
        .bind(window.rate_limit_hit_count)
        .bind(window.total_latency_ms)
        .bind(window.min_latency_ms)
        .bind(window.max_latency_ms)
        .execute(self.db.pool())
        .await
        .map_err(|e| FlowgateError::Database(format!("Accumulate rate window: {e}")))?;

        Ok(())
    }

    /// Windows for a provider starting at or after `since`, oldest first.
    pub async fn get_windows_since(
        &self,
        provider: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RateWindow>> {
        let rows: Vec<WindowRow> = sqlx::query_as(
            "SELECT provider, window_start, request_count, success_count, error_count,
                    rate_limit_hit_count, total_latency_ms, min_latency_ms, max_latency_ms
             FROM rate_metrics
             WHERE provider = ? AND window_start >= ?
             ORDER BY window_start ASC",
        )
        .bind(provider)
        .bind(to_db_time(since))
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| FlowgateError::Database(format!("Get rate windows: {e}")))?;

        Ok(rows.into_iter().filter_map(row_to_window).collect())
    }

    /// Totals per provider over windows starting at or after `since`.
    pub async fn summarize_since(
        &self,
        provider: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<RateSummary>> {
        let base = "SELECT
                        provider,
                        SUM(request_count) as requests,
                        SUM(success_count) as successes,
                        SUM(error_count) as errors,
                        SUM(rate_limit_hit_count) as rate_limit_hits,
                        SUM(total_latency_ms) as total_latency_ms,
                        MIN(min_latency_ms) as min_latency_ms,
                        MAX(max_latency_ms) as max_latency_ms
                    FROM rate_metrics
                    WHERE window_start >= ?";

        let rows: Vec<SummaryRow> = match provider {
            Some(p) => {
                sqlx::query_as(&format!("{base} AND provider = ? GROUP BY provider"))
                    .bind(to_db_time(since))
                    .bind(p)
                    .fetch_all(self.db.pool())
                    .await
            }
            None => {
                sqlx::query_as(&format!("{base} GROUP BY provider ORDER BY provider"))
                    .bind(to_db_time(since))
                    .fetch_all(self.db.pool())
                    .await
            }
        }
        .map_err(|e| FlowgateError::Database(format!("Summarize rate windows: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let requests = r.requests.unwrap_or(0);
                let total_latency = r.total_latency_ms.unwrap_or(0);
                RateSummary {
                    provider: r.provider,
                    requests,
                    successes: r.successes.unwrap_or(0),
                    errors: r.errors.unwrap_or(0),
                    rate_limit_hits: r.rate_limit_hits.unwrap_or(0),
                    avg_latency_ms: if requests > 0 {
                        total_latency as f64 / requests as f64
                    } else {
                        0.0
                    },
                    min_latency_ms: r.min_latency_ms,
                    max_latency_ms: r.max_latency_ms,
                }
            })
            .collect())
    }

    /// Drop windows older than `before`. Returns the number of rows removed.
    pub async fn prune_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_metrics WHERE window_start < ?")
            .bind(to_db_time(before))
            .execute(self.db.pool())
            .await
            .map_err(|e| FlowgateError::Database(format!("Prune rate windows: {e}")))?;

        Ok(result.rows_affected())
    }
}

/// Aggregated traffic for one provider.
#[derive(Debug, Clone)]
pub struct RateSummary {
    pub provider: String,
    pub requests: i64,
    pub successes: i64,
    pub errors: i64,
    pub rate_limit_hits: i64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: Option<i64>,
    pub max_latency_ms: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct WindowRow {
    provider: String,
    window_start: String,
    request_count: i64,
    success_count: i64,
    error_count: i64,
    rate_limit_hit_count: i64,
    total_latency_ms: i64,
    min_latency_ms: Option<i64>,
    max_latency_ms: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    provider: String,
    requests: Option<i64>,
    successes: Option<i64>,
    errors: Option<i64>,
    rate_limit_hits: Option<i64>,
    total_latency_ms: Option<i64>,
    min_latency_ms: Option<i64>,
    max_latency_ms: Option<i64>,
}

fn row_to_window(r: WindowRow) -> Option<RateWindow> {
    Some(RateWindow {
        provider: r.provider,
        window_start: from_db_time(&r.window_start)?,
        request_count: r.request_count,
        success_count: r.success_count,
        error_count: r.error_count,
        rate_limit_hit_count: r.rate_limit_hit_count,
        total_latency_ms: r.total_latency_ms,
        min_latency_ms: r.min_latency_ms,
        max_latency_ms: r.max_latency_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    async fn setup() -> Database {
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    fn window(provider: &str, start: DateTime<Utc>, latencies: &[i64]) -> RateWindow {
        let mut w = RateWindow::new(provider, start);
        for &l in latencies {
            w.record(l, false, false);
        }
        w
    }

    #[tokio::test]
    async fn accumulate_adds_to_existing_minute() {
        let db = setup().await;
        let repo = RateMetricsRepository::new(&db);
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();

        repo.accumulate_window(&window("anthropic", start, &[100, 200]))
            .await
            .unwrap();
        let mut second = window("anthropic", start, &[50]);
        second.record(400, true, true);
        repo.accumulate_window(&second).await.unwrap();

        let windows = repo.get_windows_since("anthropic", start).await.unwrap();
        assert_eq!(windows.len(), 1);
        let w = &windows[0];
        assert_eq!(w.window_start, start);
        assert_eq!(w.request_count, 4);
        assert_eq!(w.error_count, 1);
        assert_eq!(w.rate_limit_hit_count, 1);
        assert_eq!(w.total_latency_ms, 750);
        assert_eq!(w.min_latency_ms, Some(50));
        assert_eq!(w.max_latency_ms, Some(400));
    }

    #[tokio::test]
    async fn windows_since_filters_provider_and_time() {
        let db = setup().await;
        let repo = RateMetricsRepository::new(&db);
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let t1 = t0 + Duration::minutes(1);
        let t2 = t0 + Duration::minutes(2);

        repo.accumulate_window(&window("anthropic", t0, &[10])).await.unwrap();
        repo.accumulate_window(&window("anthropic", t1, &[10])).await.unwrap();
        repo.accumulate_window(&window("anthropic", t2, &[10])).await.unwrap();
        repo.accumulate_window(&window("openai", t2, &[10])).await.unwrap();

        let windows = repo.get_windows_since("anthropic", t1).await.unwrap();
        let starts: Vec<_> = windows.iter().map(|w| w.window_start).collect();
        assert_eq!(starts, vec![t1, t2]);
    }

    #[tokio::test]
    async fn summary_groups_by_provider() {
        let db = setup().await;
        let repo = RateMetricsRepository::new(&db);
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();

        repo.accumulate_window(&window("anthropic", t0, &[100, 300])).await.unwrap();
        repo.accumulate_window(&window("anthropic", t0 + Duration::minutes(1), &[200]))
            .await
            .unwrap();
        repo.accumulate_window(&window("openai", t0, &[50])).await.unwrap();

        let all = repo.summarize_since(None, t0).await.unwrap();
        assert_eq!(all.len(), 2);
        let anthropic = all.iter().find(|s| s.provider == "anthropic").unwrap();
        assert_eq!(anthropic.requests, 3);
        assert!((anthropic.avg_latency_ms - 200.0).abs() < 1e-9);
        assert_eq!(anthropic.max_latency_ms, Some(300));

        let only = repo.summarize_since(Some("openai"), t0).await.unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].requests, 1);
    }

    #[tokio::test]
    async fn prune_removes_old_windows() {
        let db = setup().await;
        let repo = RateMetricsRepository::new(&db);
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();

        repo.accumulate_window(&window("anthropic", t0, &[1])).await.unwrap();
        repo.accumulate_window(&window("anthropic", t0 + Duration::hours(2), &[1]))
            .await
            .unwrap();

        let removed = repo.prune_before(t0 + Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.get_windows_since("anthropic", t0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_summary() {
        let db = setup().await;
        let repo = RateMetricsRepository::new(&db);
        assert!(repo.summarize_since(None, Utc::now()).await.unwrap().is_empty());
    }
}
