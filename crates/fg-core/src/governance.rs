use std::sync::Arc;

use tracing::info;

use fg_config::Config;
use fg_db::Database;

use crate::admission_queue::AdmissionQueue;
use crate::governed_client::GovernedClient;
use crate::key_pool::KeyPool;
use crate::maintenance::{MaintenanceReport, MaintenanceTask};
use crate::provider::LlmProvider;
use crate::utils::{CircuitBreakerRegistry, RateGovernor};

/// Every governance component for one provider, wired from configuration.
pub struct Governance {
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub keys: Arc<KeyPool>,
    pub rate: Arc<RateGovernor>,
    pub client: Arc<GovernedClient>,
    pub queue: Arc<AdmissionQueue>,
    maintenance: MaintenanceTask,
}

impl Governance {
    /// Build the components, load recent rate windows and start maintenance.
    pub async fn start(config: &Config, db: Arc<Database>, provider: Arc<dyn LlmProvider>) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit.clone()));
        let keys = Arc::new(KeyPool::new(db.clone(), config.keys.clone()));
        let rate = Arc::new(RateGovernor::new(db));
        rate.warm_up(provider.name()).await;

        let client = Arc::new(GovernedClient::new(
            provider,
            breakers.clone(),
            keys.clone(),
            rate.clone(),
            config,
        ));
        let queue = Arc::new(AdmissionQueue::new(config.queue.clone()));

        let interval = config.rate.flush_interval.min(config.keys.sweep_interval);
        let mut maintenance = MaintenanceTask::new(rate.clone(), keys.clone(), interval);
        maintenance.start();

        info!(provider = client.provider_name(), "Governance started");
        Self {
            breakers,
            keys,
            rate,
            client,
            queue,
            maintenance,
        }
    }

    /// Stop maintenance after a final flush.
    pub async fn shutdown(mut self) -> MaintenanceReport {
        let report = self.maintenance.stop().await;
        info!("Governance stopped");
        report
    }
}
