use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use fg_types::{FlowgateError, Result};

/// Async SQLite database connection manager.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection from file path.
    pub async fn new(path: &Path) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_millis(5000));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| FlowgateError::Database(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Create a new in-memory database (for testing).
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::new().filename(":memory:");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| FlowgateError::Database(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Initialize all database tables and indexes.
    pub async fn initialize(&self) -> Result<()> {
        // Shared rotation pool
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                secret TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                cooldown_until TEXT,
                requests_today INTEGER NOT NULL DEFAULT 0,
                last_request_date TEXT,
                rate_limit_hits INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| FlowgateError::Database(format!("Create api_keys table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_api_keys_provider
             ON api_keys(provider, is_active, priority)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| FlowgateError::Database(format!("Create api_keys index: {e}")))?;

        // Tenant-dedicated keys
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tenant_keys (
                tenant_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                secret TEXT NOT NULL,
                cooldown_until TEXT,
                PRIMARY KEY (tenant_id, provider)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| FlowgateError::Database(format!("Create tenant_keys table: {e}")))?;

        // Per-minute rate windows
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rate_metrics (
                provider TEXT NOT NULL,
                window_start TEXT NOT NULL,
                request_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                rate_limit_hit_count INTEGER NOT NULL DEFAULT 0,
                total_latency_ms INTEGER NOT NULL DEFAULT 0,
                min_latency_ms INTEGER,
                max_latency_ms INTEGER,
                PRIMARY KEY (provider, window_start)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| FlowgateError::Database(format!("Create rate_metrics table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_rate_metrics_time
             ON rate_metrics(window_start)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| FlowgateError::Database(format!("Create rate_metrics index: {e}")))?;

        info!("Database schema initialized (3 tables, 2 indexes)");
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection closed");
    }
}

/// Timestamps are stored as second-precision RFC 3339 so they sort as text.
pub(crate) fn to_db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn from_db_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
