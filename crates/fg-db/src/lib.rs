pub mod connection;
pub mod keys;
pub mod rate_metrics;

pub use connection::Database;
pub use keys::KeyRepository;
pub use rate_metrics::{RateMetricsRepository, RateSummary};
