use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::store::KeyStore;

/// A fire-and-forget store update.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteJob {
    KeyUsage { key_id: String, day: NaiveDate },
    KeyCooldown { key_id: String, until: DateTime<Utc> },
    TenantCooldown { tenant_id: String, until: DateTime<Utc> },
}

enum Message {
    Job(WriteJob),
    Barrier(oneshot::Sender<()>),
}

/// Bounded queue of store writes drained by a dedicated task.
///
/// Submission never waits: when the queue is full the job is dropped and
/// counted. Failed writes are logged and forgotten.
pub struct BackgroundWriter {
    tx: mpsc::Sender<Message>,
    dropped: Arc<AtomicU64>,
}

impl BackgroundWriter {
    /// Spawn the drain task. Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn KeyStore>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Message>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    Message::Job(job) => apply(store.as_ref(), job).await,
                    Message::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Background writer drained");
        });

        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue a job. Returns false if it was dropped.
    pub fn submit(&self, job: WriteJob) -> bool {
        match self.tx.try_send(Message::Job(job)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(Message::Job(job))) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(job = ?job, "Background writer queue full, dropping job");
                false
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Background writer closed, dropping job");
                false
            }
        }
    }

    /// Wait until every job submitted before this call has been applied.
    pub async fn sync(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Barrier(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Jobs dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn apply(store: &dyn KeyStore, job: WriteJob) {
    let result = match &job {
        WriteJob::KeyUsage { key_id, day } => store.increment_usage(key_id, *day).await,
        WriteJob::KeyCooldown { key_id, until } => store.set_key_cooldown(key_id, *until).await,
        WriteJob::TenantCooldown { tenant_id, until } => {
            store.set_tenant_cooldown(tenant_id, *until).await
        }
    };

    if let Err(e) = result {
        warn!(job = ?job, error = %e, "Background write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FailingStore;
    use fg_db::{Database, KeyRepository};
    use fg_types::ApiKey;

    #[tokio::test]
    async fn jobs_reach_the_store() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.initialize().await.unwrap();
        KeyRepository::new(&db)
            .upsert_key(&ApiKey::new("k1", "anthropic", "sk", 0))
            .await
            .unwrap();

        let writer = BackgroundWriter::new(db.clone(), 8);
        let day = Utc::now().date_naive();
        assert!(writer.submit(WriteJob::KeyUsage {
            key_id: "k1".to_string(),
            day
        }));
        assert!(writer.submit(WriteJob::KeyUsage {
            key_id: "k1".to_string(),
            day
        }));
        writer.sync().await;

        let keys = KeyRepository::new(&db).list_keys(None).await.unwrap();
        assert_eq!(keys[0].requests_today, 2);
        assert_eq!(writer.dropped(), 0);
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let writer = BackgroundWriter::new(Arc::new(FailingStore), 4);
        writer.submit(WriteJob::KeyCooldown {
            key_id: "k1".to_string(),
            until: Utc::now(),
        });
        writer.sync().await;
        assert_eq!(writer.dropped(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_drops_without_blocking() {
        // On a current-thread runtime the drain task cannot run until we yield.
        let writer = BackgroundWriter::new(Arc::new(FailingStore), 2);
        let job = WriteJob::TenantCooldown {
            tenant_id: "acme".to_string(),
            until: Utc::now(),
        };

        assert!(writer.submit(job.clone()));
        assert!(writer.submit(job.clone()));
        assert!(!writer.submit(job));
        assert_eq!(writer.dropped(), 1);

        writer.sync().await;
    }
}
