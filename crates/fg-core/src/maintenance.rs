use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::key_pool::KeyPool;
use crate::utils::RateGovernor;

/// Work done by one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub windows_flushed: usize,
    pub cooldowns_swept: usize,
}

/// Periodic flush of rate windows and sweep of expired key cooldowns.
pub struct MaintenanceTask {
    rate: Arc<RateGovernor>,
    keys: Arc<KeyPool>,
    interval: Duration,
    running: Arc<AtomicBool>,
    task_handle: Option<JoinHandle<()>>,
}

impl MaintenanceTask {
    pub fn new(rate: Arc<RateGovernor>, keys: Arc<KeyPool>, interval: Duration) -> Self {
        Self {
            rate,
            keys,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            task_handle: None,
        }
    }

    /// Start the background loop.
    pub fn start(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!("Maintenance task is already running");
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let rate = self.rate.clone();
        let keys = self.keys.clone();
        let interval = self.interval.max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs_f64(), "Maintenance task started");
            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(interval).await;
                run_pass(&rate, &keys).await;
            }
        });

        self.task_handle = Some(handle);
    }

    /// Stop the loop and run a final pass so buffered windows are persisted.
    pub async fn stop(&mut self) -> MaintenanceReport {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        let report = self.run_once().await;
        self.keys.flush_writes().await;
        info!(
            windows_flushed = report.windows_flushed,
            "Maintenance task stopped"
        );
        report
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One flush-and-sweep pass, outside the schedule.
    pub async fn run_once(&self) -> MaintenanceReport {
        run_pass(&self.rate, &self.keys).await
    }
}

async fn run_pass(rate: &RateGovernor, keys: &KeyPool) -> MaintenanceReport {
    let report = MaintenanceReport {
        windows_flushed: rate.flush().await,
        cooldowns_swept: keys.sweep_expired().await,
    };
    debug!(
        windows = report.windows_flushed,
        cooldowns = report.cooldowns_swept,
        "Maintenance pass complete"
    );
    report
}
