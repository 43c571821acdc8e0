pub mod config;

pub use config::{
    get_config, reload_config, CircuitBreakerSettings, Config, KeyPoolSettings,
    LoggingSettings, QueueSettings, RateLimitSettings, RetrySettings,
};
