use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use fg_db::{Database, KeyRepository, RateMetricsRepository};
use fg_types::{ApiKey, RateWindow, Result, TenantKey};

/// Credential rows the rotation pool reads and writes.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn active_keys(&self, provider: &str) -> Result<Vec<ApiKey>>;

    async fn tenant_key(&self, tenant_id: &str, provider: &str) -> Result<Option<TenantKey>>;

    async fn set_key_cooldown(&self, key_id: &str, until: DateTime<Utc>) -> Result<()>;

    async fn set_tenant_cooldown(&self, tenant_id: &str, until: DateTime<Utc>) -> Result<()>;

    async fn increment_usage(&self, key_id: &str, today: NaiveDate) -> Result<()>;
}

/// Persisted per-minute traffic windows.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn accumulate_window(&self, window: &RateWindow) -> Result<()>;

    async fn recent_windows(&self, provider: &str, since: DateTime<Utc>) -> Result<Vec<RateWindow>>;
}

#[async_trait]
impl KeyStore for Database {
    async fn active_keys(&self, provider: &str) -> Result<Vec<ApiKey>> {
        KeyRepository::new(self).get_active_keys(provider).await
    }

    async fn tenant_key(&self, tenant_id: &str, provider: &str) -> Result<Option<TenantKey>> {
        KeyRepository::new(self).get_tenant_key(tenant_id, provider).await
    }

    async fn set_key_cooldown(&self, key_id: &str, until: DateTime<Utc>) -> Result<()> {
        KeyRepository::new(self).set_cooldown(key_id, until).await?;
        Ok(())
    }

    async fn set_tenant_cooldown(&self, tenant_id: &str, until: DateTime<Utc>) -> Result<()> {
        KeyRepository::new(self)
            .set_tenant_cooldown(tenant_id, until)
            .await?;
        Ok(())
    }

    async fn increment_usage(&self, key_id: &str, today: NaiveDate) -> Result<()> {
        KeyRepository::new(self).increment_usage(key_id, today).await
    }
}

#[async_trait]
impl MetricsStore for Database {
    async fn accumulate_window(&self, window: &RateWindow) -> Result<()> {
        RateMetricsRepository::new(self).accumulate_window(window).await
    }

    async fn recent_windows(&self, provider: &str, since: DateTime<Utc>) -> Result<Vec<RateWindow>> {
        RateMetricsRepository::new(self)
            .get_windows_since(provider, since)
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup() -> Database {
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    #[tokio::test]
    async fn database_serves_key_store() {
        let db = setup().await;
        KeyRepository::new(&db)
            .upsert_key(&ApiKey::new("k1", "anthropic", "sk-1", 1))
            .await
            .unwrap();

        let store: &dyn KeyStore = &db;
        assert_eq!(store.active_keys("anthropic").await.unwrap().len(), 1);

        store
            .set_key_cooldown("k1", Utc::now() + Duration::seconds(30))
            .await
            .unwrap();
        let keys = store.active_keys("anthropic").await.unwrap();
        assert_eq!(keys[0].rate_limit_hits, 1);
        assert!(store.tenant_key("acme", "anthropic").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn database_serves_metrics_store() {
        let db = setup().await;
        let store: &dyn MetricsStore = &db;
        let start = fg_types::minute_floor(Utc::now());

        let mut window = RateWindow::new("anthropic", start);
        window.record(120, false, false);
        store.accumulate_window(&window).await.unwrap();
        store.accumulate_window(&window).await.unwrap();

        let windows = store.recent_windows("anthropic", start).await.unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].request_count, 2);
    }
}
