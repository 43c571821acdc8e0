pub mod admission_queue;
pub mod background;
pub mod governance;
pub mod governed_client;
pub mod key_pool;
pub mod logging;
pub mod maintenance;
pub mod priority;
pub mod provider;
pub mod store;
pub mod utils;

pub use admission_queue::{AdmissionQueue, ProcessReport, QueueWorker};
pub use background::{BackgroundWriter, WriteJob};
pub use governance::Governance;
pub use governed_client::{DegradeReason, GovernedClient, Reply};
pub use key_pool::{KeyPool, KeyStatus};
pub use logging::init_logging;
pub use maintenance::{MaintenanceReport, MaintenanceTask};
pub use priority::PriorityClassifier;
pub use provider::LlmProvider;
pub use store::{KeyStore, MetricsStore};
pub use utils::{
    with_retry, with_retry_hooks, CircuitBreakerRegistry, CircuitStatus, NoHooks, RateGovernor,
    RateStats, RetryHooks, RetryableError, ThrottleDecision, WeightedRing,
};
