use std::path::PathBuf;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use fg_types::{FlowgateError, Result};
use tracing::warn;

/// Circuit breaker thresholds for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
        }
    }
}

/// Backoff policy for upstream calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub jitter_percent: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_percent: 25.0,
        }
    }
}

/// Request budget and throttle thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitSettings {
    pub max_requests_per_minute: u32,
    pub throttle_percent: f64,
    pub critical_percent: f64,
    pub max_delay_ms: u64,
    /// Minimum delay after the provider reported a rate limit in the last minute.
    pub rate_limit_delay_ms: u64,
    pub flush_interval: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 50,
            throttle_percent: 70.0,
            critical_percent: 90.0,
            max_delay_ms: 5000,
            rate_limit_delay_ms: 2000,
            flush_interval: Duration::from_secs(60),
        }
    }
}

/// Credential pool behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPoolSettings {
    pub cache_ttl: Duration,
    pub default_cooldown: Duration,
    pub fallback_api_key: Option<String>,
    pub sweep_interval: Duration,
    pub writer_queue_size: usize,
}

impl Default for KeyPoolSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            default_cooldown: Duration::from_secs(60),
            fallback_api_key: None,
            sweep_interval: Duration::from_secs(300),
            writer_queue_size: 256,
        }
    }
}

/// Admission queue sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub max_queue_size: usize,
    pub concurrency: usize,
    pub processing_timeout: Duration,
    /// Seed for the wait estimate before any item has completed.
    pub avg_processing_ms: u64,
    /// How many senders are remembered for first-contact detection.
    pub known_senders: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            concurrency: 5,
            processing_timeout: Duration::from_secs(60),
            avg_processing_ms: 3000,
            known_senders: 10_000,
        }
    }
}

/// Logging output.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
    pub file: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // Project settings
    pub project_name: String,
    pub db_path: PathBuf,

    // Upstream
    pub default_provider: String,
    pub default_model: String,
    pub call_timeout: Duration,
    pub degraded_response: String,

    // Governance
    pub circuit: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub rate: RateLimitSettings,
    pub keys: KeyPoolSettings,
    pub queue: QueueSettings,

    // Logging
    pub logging: LoggingSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_name: "Flowgate".to_string(),
            db_path: PathBuf::from("store/flowgate.db"),
            default_provider: "anthropic".to_string(),
            default_model: "claude-sonnet-4-20250514".to_string(),
            call_timeout: Duration::from_secs(60),
            degraded_response: "Thanks for your message! We're handling a lot of conversations \
                                right now and will get back to you shortly."
                .to_string(),
            circuit: CircuitBreakerSettings::default(),
            retry: RetrySettings::default(),
            rate: RateLimitSettings::default(),
            keys: KeyPoolSettings::default(),
            queue: QueueSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables (with dotenvy).
    pub fn load() -> Result<Self> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();

        let d = Config::default();

        let config = Config {
            project_name: env_or("PROJECT_NAME", || d.project_name.clone()),
            db_path: env_path_or("DB_PATH", || d.db_path.clone()),

            default_provider: env_or("DEFAULT_PROVIDER", || d.default_provider.clone()),
            default_model: env_or("DEFAULT_MODEL", || d.default_model.clone()),
            call_timeout: env_millis("CALL_TIMEOUT_MS", d.call_timeout),
            degraded_response: env_or("DEGRADED_RESPONSE", || d.degraded_response.clone()),

            circuit: CircuitBreakerSettings {
                failure_threshold: env_u32(
                    "CIRCUIT_FAILURE_THRESHOLD",
                    d.circuit.failure_threshold,
                ),
                success_threshold: env_u32(
                    "CIRCUIT_SUCCESS_THRESHOLD",
                    d.circuit.success_threshold,
                ),
                reset_timeout: env_millis("CIRCUIT_RESET_TIMEOUT_MS", d.circuit.reset_timeout),
                half_open_max_requests: env_u32(
                    "CIRCUIT_HALF_OPEN_MAX_REQUESTS",
                    d.circuit.half_open_max_requests,
                ),
            },

            retry: RetrySettings {
                max_attempts: env_u32("RETRY_MAX_ATTEMPTS", d.retry.max_attempts),
                initial_delay: env_millis("RETRY_INITIAL_DELAY_MS", d.retry.initial_delay),
                backoff_multiplier: env_f64(
                    "RETRY_BACKOFF_MULTIPLIER",
                    d.retry.backoff_multiplier,
                ),
                max_delay: env_millis("RETRY_MAX_DELAY_MS", d.retry.max_delay),
                jitter_percent: env_f64("RETRY_JITTER_PERCENT", d.retry.jitter_percent),
            },

            rate: RateLimitSettings {
                max_requests_per_minute: env_u32(
                    "RATE_MAX_REQUESTS_PER_MINUTE",
                    d.rate.max_requests_per_minute,
                ),
                throttle_percent: env_f64("RATE_THROTTLE_PERCENT", d.rate.throttle_percent),
                critical_percent: env_f64("RATE_CRITICAL_PERCENT", d.rate.critical_percent),
                max_delay_ms: env_u64("RATE_MAX_DELAY_MS", d.rate.max_delay_ms),
                rate_limit_delay_ms: env_u64("RATE_LIMIT_DELAY_MS", d.rate.rate_limit_delay_ms),
                flush_interval: env_secs("RATE_FLUSH_INTERVAL_SECS", d.rate.flush_interval),
            },

            keys: KeyPoolSettings {
                cache_ttl: env_secs("KEY_CACHE_TTL_SECS", d.keys.cache_ttl),
                default_cooldown: env_secs("KEY_DEFAULT_COOLDOWN_SECS", d.keys.default_cooldown),
                fallback_api_key: env_opt("FALLBACK_API_KEY"),
                sweep_interval: env_secs("KEY_SWEEP_INTERVAL_SECS", d.keys.sweep_interval),
                writer_queue_size: env_usize("WRITER_QUEUE_SIZE", d.keys.writer_queue_size),
            },

            queue: QueueSettings {
                max_queue_size: env_usize("QUEUE_MAX_SIZE", d.queue.max_queue_size),
                concurrency: env_usize("QUEUE_CONCURRENCY", d.queue.concurrency),
                processing_timeout: env_millis(
                    "QUEUE_PROCESSING_TIMEOUT_MS",
                    d.queue.processing_timeout,
                ),
                avg_processing_ms: env_u64("QUEUE_AVG_PROCESSING_MS", d.queue.avg_processing_ms),
                known_senders: env_usize("QUEUE_KNOWN_SENDERS", d.queue.known_senders),
            },

            logging: LoggingSettings {
                level: env_or("LOG_LEVEL", || d.logging.level.clone()),
                file: env_opt("LOG_FILE").map(PathBuf::from),
                json: env_bool("LOG_JSON", d.logging.json),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the governance layer misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.circuit.failure_threshold == 0 {
            return Err(FlowgateError::Config(
                "CIRCUIT_FAILURE_THRESHOLD must be at least 1".to_string(),
            ));
        }
        if self.circuit.success_threshold == 0 || self.circuit.half_open_max_requests == 0 {
            return Err(FlowgateError::Config(
                "half-open thresholds must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(FlowgateError::Config(
                "RETRY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.retry.jitter_percent) {
            return Err(FlowgateError::Config(format!(
                "RETRY_JITTER_PERCENT out of range: {}",
                self.retry.jitter_percent
            )));
        }
        if self.rate.throttle_percent >= self.rate.critical_percent {
            return Err(FlowgateError::Config(format!(
                "RATE_THROTTLE_PERCENT ({}) must be below RATE_CRITICAL_PERCENT ({})",
                self.rate.throttle_percent, self.rate.critical_percent
            )));
        }
        if self.queue.max_queue_size == 0 || self.queue.concurrency == 0 {
            return Err(FlowgateError::Config(
                "queue size and concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            warn!(
                multiplier = self.retry.backoff_multiplier,
                "Retry backoff multiplier below 1.0 shrinks delays between attempts"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

/// Get (or lazily initialise) the global configuration.
pub fn get_config() -> Result<Config> {
    if CONFIG.get().is_none() {
        let cfg = Config::load()?;
        let _ = CONFIG.set(RwLock::new(cfg));
    }
    let lock = CONFIG
        .get()
        .ok_or_else(|| FlowgateError::Config("Config not initialised".to_string()))?;
    let guard = lock
        .read()
        .map_err(|e| FlowgateError::Config(format!("Config lock poisoned: {e}")))?;
    Ok(guard.clone())
}

/// Reload configuration from environment.
pub fn reload_config() -> Result<Config> {
    let new_cfg = Config::load()?;
    let lock = CONFIG.get_or_init(|| RwLock::new(new_cfg.clone()));
    let mut guard = lock
        .write()
        .map_err(|e| FlowgateError::Config(format!("Config lock poisoned: {e}")))?;
    *guard = new_cfg.clone();
    Ok(new_cfg)
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: impl FnOnce() -> String) -> String {
    std::env::var(key).unwrap_or_else(|_| default())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %v, "Ignoring unparsable environment value");
            default
        }),
        Err(_) => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_parse(key, default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_parse(key, default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_parse(key, default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_parse(key, default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default.as_millis() as u64))
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}

fn env_path_or(key: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
    std::env::var(key)
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_load_defaults() {
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.circuit.failure_threshold, 5);
        assert_eq!(cfg.circuit.success_threshold, 2);
        assert_eq!(cfg.circuit.reset_timeout, Duration::from_secs(30));
        assert_eq!(cfg.circuit.half_open_max_requests, 3);
        assert_eq!(cfg.retry.jitter_percent, 25.0);
        assert_eq!(cfg.retry.max_delay, Duration::from_secs(30));
        assert_eq!(cfg.rate.throttle_percent, 70.0);
        assert_eq!(cfg.rate.critical_percent, 90.0);
        assert_eq!(cfg.rate.max_delay_ms, 5000);
    }

    #[test]
    fn config_env_override() {
        // Use a unique env var unlikely to collide
        std::env::set_var("QUEUE_KNOWN_SENDERS", "42");
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.queue.known_senders, 42);
        std::env::remove_var("QUEUE_KNOWN_SENDERS");
    }

    #[test]
    fn config_millis_override() {
        std::env::set_var("QUEUE_PROCESSING_TIMEOUT_MS", "1500");
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.queue.processing_timeout, Duration::from_millis(1500));
        std::env::remove_var("QUEUE_PROCESSING_TIMEOUT_MS");
    }

    #[test]
    fn unparsable_value_falls_back_to_default() {
        std::env::set_var("WRITER_QUEUE_SIZE", "lots");
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.keys.writer_queue_size, 256);
        std::env::remove_var("WRITER_QUEUE_SIZE");
    }

    #[test]
    fn validate_rejects_inverted_thresholds() {
        let mut cfg = Config::default();
        cfg.rate.throttle_percent = 95.0;
        assert!(matches!(cfg.validate(), Err(FlowgateError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut cfg = Config::default();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn reload_replaces_global_config() {
        std::env::set_var("DEFAULT_MODEL", "reloaded-model");
        let reloaded = reload_config().unwrap();
        assert_eq!(reloaded.default_model, "reloaded-model");
        assert_eq!(get_config().unwrap().default_model, "reloaded-model");
        std::env::remove_var("DEFAULT_MODEL");
    }

    #[test]
    fn env_path_reads_db_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gov.db");
        assert_eq!(
            env_path_or("FG_TEST_UNSET_PATH", || path.clone()),
            path
        );
    }
}
