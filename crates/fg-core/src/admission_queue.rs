use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use lru::LruCache;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fg_config::QueueSettings;
use fg_types::{EnqueueReceipt, PageContext, Priority, QueueStats, QueuedItem, Result};

use crate::priority::PriorityClassifier;

/// Idle wake-up for the worker loop when no notification arrives.
const IDLE_POLL_MS: u64 = 500;

/// Weight of the newest sample in the processing-time average.
const PROCESSING_EMA_ALPHA: f64 = 0.2;

/// Outcome counts of one `process_queue` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

enum Outcome {
    Completed,
    Failed(String),
    TimedOut,
}

#[derive(Default)]
struct Counters {
    enqueued: u64,
    dropped: u64,
    duplicates: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
    waits: u64,
    total_wait_ms: f64,
}

struct QueueInner {
    items: VecDeque<QueuedItem>,
    queued_senders: HashSet<String>,
    in_flight: HashMap<String, Instant>,
    known_senders: LruCache<String, ()>,
    counters: Counters,
    avg_processing_ms: f64,
}

impl QueueInner {
    fn estimate_wait_ms(&self, position: usize, concurrency: usize) -> u64 {
        let concurrency = concurrency.max(1);
        let free = concurrency.saturating_sub(self.in_flight.len());
        if position < free {
            return 0;
        }
        let rounds = (position - free) / concurrency + 1;
        (rounds as f64 * self.avg_processing_ms).round() as u64
    }
}

/// In-memory priority queue feeding a bounded pool of workers.
///
/// Ordered by priority, FIFO within a tier. A sender never has more than one
/// item queued or in flight.
pub struct AdmissionQueue {
    inner: Arc<Mutex<QueueInner>>,
    settings: QueueSettings,
    classifier: PriorityClassifier,
    notify: Arc<Notify>,
}

impl AdmissionQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self::with_classifier(settings, PriorityClassifier::default())
    }

    pub fn with_classifier(settings: QueueSettings, classifier: PriorityClassifier) -> Self {
        let known = NonZeroUsize::new(settings.known_senders).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                items: VecDeque::new(),
                queued_senders: HashSet::new(),
                in_flight: HashMap::new(),
                known_senders: LruCache::new(known),
                counters: Counters::default(),
                avg_processing_ms: settings.avg_processing_ms as f64,
            })),
            settings,
            classifier,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Admit a message. Returns None when the queue is full.
    ///
    /// A sender already in flight gets a zero-wait receipt and a sender
    /// already queued gets its current position; neither is queued twice.
    pub async fn enqueue(
        &self,
        sender_id: &str,
        payload: &str,
        page_context: Option<PageContext>,
        priority_override: Option<Priority>,
    ) -> Option<EnqueueReceipt> {
        let concurrency = self.settings.concurrency;
        let mut inner = self.inner.lock().await;

        if inner.in_flight.contains_key(sender_id) {
            inner.counters.duplicates += 1;
            debug!(sender = sender_id, "Sender already in flight");
            return Some(EnqueueReceipt {
                position: 0,
                estimated_wait_ms: 0,
            });
        }

        if inner.queued_senders.contains(sender_id) {
            inner.counters.duplicates += 1;
            let position = inner
                .items
                .iter()
                .position(|it| it.sender_id == sender_id)
                .unwrap_or(0);
            debug!(sender = sender_id, position, "Sender already queued");
            return Some(EnqueueReceipt {
                position,
                estimated_wait_ms: inner.estimate_wait_ms(position, concurrency),
            });
        }

        if inner.items.len() >= self.settings.max_queue_size {
            inner.counters.dropped += 1;
            warn!(
                sender = sender_id,
                dropped = inner.counters.dropped,
                "Admission queue full, dropping message"
            );
            return None;
        }

        let first_contact = inner.known_senders.put(sender_id.to_string(), ()).is_none();
        let priority = priority_override.unwrap_or_else(|| {
            self.classifier
                .classify(payload, page_context.as_ref(), first_contact)
        });

        let item = QueuedItem {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            payload: payload.to_string(),
            priority,
            queued_at: Utc::now(),
            page_context,
        };

        let position = inner.items.partition_point(|it| it.priority >= priority);
        inner.items.insert(position, item);
        inner.queued_senders.insert(sender_id.to_string());
        inner.counters.enqueued += 1;
        let estimated_wait_ms = inner.estimate_wait_ms(position, concurrency);
        drop(inner);

        debug!(sender = sender_id, priority = %priority, position, "Message queued");
        self.notify.notify_one();

        Some(EnqueueReceipt {
            position,
            estimated_wait_ms,
        })
    }

    /// Take the most urgent item and mark its sender in flight.
    pub async fn dequeue(&self) -> Option<QueuedItem> {
        let mut inner = self.inner.lock().await;
        let item = inner.items.pop_front()?;
        inner.queued_senders.remove(&item.sender_id);
        inner.in_flight.insert(item.sender_id.clone(), Instant::now());

        let waited = (Utc::now() - item.queued_at).num_milliseconds().max(0) as f64;
        inner.counters.waits += 1;
        inner.counters.total_wait_ms += waited;
        Some(item)
    }

    pub async fn mark_complete(&self, sender_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(started) = inner.in_flight.remove(sender_id) {
            inner.counters.completed += 1;
            let sample = started.elapsed().as_secs_f64() * 1000.0;
            inner.avg_processing_ms =
                PROCESSING_EMA_ALPHA * sample + (1.0 - PROCESSING_EMA_ALPHA) * inner.avg_processing_ms;
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub async fn mark_failed(&self, sender_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.in_flight.remove(sender_id).is_some() {
            inner.counters.failed += 1;
        }
        drop(inner);
        self.notify.notify_one();
    }

    async fn mark_timed_out(&self, sender_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.in_flight.remove(sender_id).is_some() {
            inner.counters.failed += 1;
            inner.counters.timed_out += 1;
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Dispatch up to `concurrency` (minus what is already in flight) items
    /// to `handler` and wait for each to finish or time out.
    ///
    /// A timed-out handler is detached, not aborted; its sender leaves the
    /// in-flight set immediately.
    pub async fn process_queue<H, Fut>(&self, handler: Arc<H>, concurrency: usize) -> ProcessReport
    where
        H: Fn(QueuedItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let free = {
            let inner = self.inner.lock().await;
            concurrency.saturating_sub(inner.in_flight.len())
        };

        let mut running = Vec::with_capacity(free);
        for _ in 0..free {
            let Some(item) = self.dequeue().await else {
                break;
            };
            let sender = item.sender_id.clone();
            running.push((sender, spawn_item(handler.clone(), item, self.settings.processing_timeout)));
        }

        let mut report = ProcessReport {
            dispatched: running.len(),
            ..Default::default()
        };
        for (sender, handle) in running {
            let outcome = handle
                .await
                .unwrap_or_else(|e| Outcome::Failed(format!("worker task failed: {e}")));
            match self.settle(&sender, outcome).await {
                Outcome::Completed => report.completed += 1,
                Outcome::Failed(_) => report.failed += 1,
                Outcome::TimedOut => report.timed_out += 1,
            }
        }
        report
    }

    /// Run a dispatcher that keeps every worker slot busy until stopped.
    pub fn start_workers<H, Fut>(self: &Arc<Self>, handler: Arc<H>) -> QueueWorker
    where
        H: Fn(QueuedItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::clone(self);
        let flag = running.clone();

        let handle = tokio::spawn(async move {
            info!(concurrency = queue.settings.concurrency, "Admission queue workers started");
            while flag.load(Ordering::SeqCst) {
                while let Some(item) = queue.next_if_slot_free().await {
                    let sender = item.sender_id.clone();
                    let job = spawn_item(handler.clone(), item, queue.settings.processing_timeout);
                    let q = Arc::clone(&queue);
                    tokio::spawn(async move {
                        let outcome = job
                            .await
                            .unwrap_or_else(|e| Outcome::Failed(format!("worker task failed: {e}")));
                        q.settle(&sender, outcome).await;
                    });
                }

                tokio::select! {
                    _ = queue.notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(IDLE_POLL_MS)) => {}
                }
            }
            info!("Admission queue workers stopped");
        });

        QueueWorker {
            running,
            handle: Some(handle),
        }
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let c = &inner.counters;
        QueueStats {
            queued: inner.items.len(),
            in_flight: inner.in_flight.len(),
            enqueued_total: c.enqueued,
            dropped_total: c.dropped,
            duplicates_total: c.duplicates,
            completed_total: c.completed,
            failed_total: c.failed,
            timed_out_total: c.timed_out,
            avg_wait_ms: if c.waits > 0 {
                c.total_wait_ms / c.waits as f64
            } else {
                0.0
            },
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn next_if_slot_free(&self) -> Option<QueuedItem> {
        {
            let inner = self.inner.lock().await;
            if inner.in_flight.len() >= self.settings.concurrency.max(1) {
                return None;
            }
        }
        self.dequeue().await
    }

    async fn settle(&self, sender: &str, outcome: Outcome) -> Outcome {
        match &outcome {
            Outcome::Completed => self.mark_complete(sender).await,
            Outcome::Failed(reason) => {
                error!(sender, reason = %reason, "Queued message failed");
                self.mark_failed(sender).await;
            }
            Outcome::TimedOut => {
                warn!(
                    sender,
                    timeout_ms = self.settings.processing_timeout.as_millis() as u64,
                    "Queued message timed out"
                );
                self.mark_timed_out(sender).await;
            }
        }
        outcome
    }
}

/// Start `handler` on its own task and race it against `timeout`.
fn spawn_item<H, Fut>(handler: Arc<H>, item: QueuedItem, timeout: Duration) -> JoinHandle<Outcome>
where
    H: Fn(QueuedItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let job = tokio::spawn(handler(item));
        match tokio::time::timeout(timeout, job).await {
            Ok(Ok(Ok(()))) => Outcome::Completed,
            Ok(Ok(Err(e))) => Outcome::Failed(e.to_string()),
            Ok(Err(e)) => Outcome::Failed(format!("handler panicked: {e}")),
            // Dropping the JoinHandle detaches the handler.
            Err(_) => Outcome::TimedOut,
        }
    })
}

/// Handle to the dispatcher started by [`AdmissionQueue::start_workers`].
pub struct QueueWorker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl QueueWorker {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop dispatching. Handlers already running are left to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        info!("Admission queue worker stop requested");
    }
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}
