use chrono::{DateTime, NaiveDate, Utc};

use fg_types::{ApiKey, FlowgateError, Result, TenantKey};

use crate::connection::{from_db_time, to_db_time, Database};

/// Repository for pool and tenant credentials.
pub struct KeyRepository<'a> {
    db: &'a Database,
}

impl<'a> KeyRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a pool key, or update secret/priority/active flag of an existing one.
    pub async fn upsert_key(&self, key: &ApiKey) -> Result<()> {
        sqlx::query(
            "INSERT INTO api_keys (id, provider, secret, priority, is_active, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                provider = excluded.provider,
                secret = excluded.secret,
                priority = excluded.priority,
                is_active = excluded.is_active",
        )
        .bind(&key.id)
        .bind(&key.provider)
        .bind(&key.secret)
        .bind(i64::from(key.priority))
        .bind(key.is_active as i32)
        .bind(to_db_time(Utc::now()))
        .execute(self.db.pool())
        .await
        .map_err(|e| FlowgateError::Database(format!("Upsert key: {e}")))?;

        Ok(())
    }

    /// Active pool keys for a provider, highest priority first.
    pub async fn get_active_keys(&self, provider: &str) -> Result<Vec<ApiKey>> {
        let rows: Vec<KeyRow> = sqlx::query_as(
            "SELECT id, provider, secret, priority, is_active, cooldown_until,
                    requests_today, last_request_date, rate_limit_hits
             FROM api_keys
             WHERE provider = ? AND is_active = 1
             ORDER BY priority DESC, id ASC",
        )
        .bind(provider)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| FlowgateError::Database(format!("Get active keys: {e}")))?;

        Ok(rows.into_iter().map(row_to_key).collect())
    }

    /// All pool keys, optionally filtered by provider.
    pub async fn list_keys(&self, provider: Option<&str>) -> Result<Vec<ApiKey>> {
        let base = "SELECT id, provider, secret, priority, is_active, cooldown_until,
                           requests_today, last_request_date, rate_limit_hits
                    FROM api_keys";

        let rows: Vec<KeyRow> = match provider {
            Some(p) => {
                sqlx::query_as(&format!(
                    "{base} WHERE provider = ? ORDER BY provider, priority DESC, id"
                ))
                .bind(p)
                .fetch_all(self.db.pool())
                .await
            }
            None => {
                sqlx::query_as(&format!("{base} ORDER BY provider, priority DESC, id"))
                    .fetch_all(self.db.pool())
                    .await
            }
        }
        .map_err(|e| FlowgateError::Database(format!("List keys: {e}")))?;

        Ok(rows.into_iter().map(row_to_key).collect())
    }

    /// Take a key out of rotation. Returns false if the key does not exist.
    pub async fn deactivate_key(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE api_keys SET is_active = 0 WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(|e| FlowgateError::Database(format!("Deactivate key: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Put a pool key on cooldown and count the rate-limit hit.
    pub async fn set_cooldown(&self, id: &str, until: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE api_keys
             SET cooldown_until = ?, rate_limit_hits = rate_limit_hits + 1
             WHERE id = ?",
        )
        .bind(to_db_time(until))
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(|e| FlowgateError::Database(format!("Set key cooldown: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Count one request against today's usage, restarting the count on a new day.
    pub async fn increment_usage(&self, id: &str, today: NaiveDate) -> Result<()> {
        let today = today.to_string();
        sqlx::query(
            "UPDATE api_keys
             SET requests_today = CASE WHEN last_request_date = ? THEN requests_today + 1 ELSE 1 END,
                 last_request_date = ?
             WHERE id = ?",
        )
        .bind(&today)
        .bind(&today)
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(|e| FlowgateError::Database(format!("Increment key usage: {e}")))?;

        Ok(())
    }

    /// Dedicated key for a tenant, if one is configured.
    pub async fn get_tenant_key(&self, tenant_id: &str, provider: &str) -> Result<Option<TenantKey>> {
        let row: Option<TenantKeyRow> = sqlx::query_as(
            "SELECT tenant_id, provider, secret, cooldown_until
             FROM tenant_keys WHERE tenant_id = ? AND provider = ?",
        )
        .bind(tenant_id)
        .bind(provider)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| FlowgateError::Database(format!("Get tenant key: {e}")))?;

        Ok(row.map(|r| TenantKey {
            tenant_id: r.tenant_id,
            provider: r.provider,
            secret: r.secret,
            cooldown_until: r.cooldown_until.as_deref().and_then(from_db_time),
        }))
    }

    pub async fn upsert_tenant_key(&self, key: &TenantKey) -> Result<()> {
        sqlx::query(
            "INSERT INTO tenant_keys (tenant_id, provider, secret, cooldown_until)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(tenant_id, provider) DO UPDATE SET secret = excluded.secret",
        )
        .bind(&key.tenant_id)
        .bind(&key.provider)
        .bind(&key.secret)
        .bind(key.cooldown_until.map(to_db_time))
        .execute(self.db.pool())
        .await
        .map_err(|e| FlowgateError::Database(format!("Upsert tenant key: {e}")))?;

        Ok(())
    }

    /// Cool down every provider key of a tenant.
    pub async fn set_tenant_cooldown(&self, tenant_id: &str, until: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE tenant_keys SET cooldown_until = ? WHERE tenant_id = ?")
            .bind(to_db_time(until))
            .bind(tenant_id)
            .execute(self.db.pool())
            .await
            .map_err(|e| FlowgateError::Database(format!("Set tenant cooldown: {e}")))?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(sqlx::FromRow)]
struct KeyRow {
    id: String,
    provider: String,
    secret: String,
    priority: i64,
    is_active: i32,
    cooldown_until: Option<String>,
    requests_today: i64,
    last_request_date: Option<String>,
    rate_limit_hits: i64,
}

#[derive(sqlx::FromRow)]
struct TenantKeyRow {
    tenant_id: String,
    provider: String,
    secret: String,
    cooldown_until: Option<String>,
}

fn row_to_key(r: KeyRow) -> ApiKey {
    ApiKey {
        id: r.id,
        provider: r.provider,
        secret: r.secret,
        priority: u32::try_from(r.priority).unwrap_or(0),
        is_active: r.is_active != 0,
        cooldown_until: r.cooldown_until.as_deref().and_then(from_db_time),
        requests_today: r.requests_today,
        last_request_date: r
            .last_request_date
            .as_deref()
            .and_then(|d| d.parse::<NaiveDate>().ok()),
        rate_limit_hits: r.rate_limit_hits,
    }
}
