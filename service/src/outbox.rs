//! Bounded queue for fire-and-forget side effects.
//!
//! Event-log appends, replication publishes and cache repairs never sit on
//! the caller's path: they are submitted here and executed in order by a
//! single worker task.
//!
//! ```text
//! pipeline / engine / repository ──try_send──▶ [ bounded mpsc ] ──▶ OutboxWorker
//!                                                                  ├─ EventLog::append
//!                                                                  ├─ EventBus::publish
//!                                                                  └─ FastCache::set
//! ```
//!
//! A full queue rejects the job instead of blocking; the rejection is logged
//! and reported to the notifier. Failed jobs are logged, reported and counted,
//! never retried here: the periodic cache rebuild and replica overwrites
//! converge the read tiers.

use crate::notifier::alert;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use stockroom_core::cache::FastCache;
use stockroom_core::event_bus::EventBus;
use stockroom_core::event_log::EventLog;
use stockroom_core::message::CatalogMessage;
use stockroom_core::model::{EventRecord, MessageType, Product};
use stockroom_core::notifier::Notifier;
use stockroom_core::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Notify, broadcast, mpsc};
use uuid::Uuid;

/// A side effect.
#[derive(Debug, Clone)]
pub enum Job {
    /// Append audit records.
    AppendLog(Vec<EventRecord>),
    /// Publish a message.
    Publish {
        /// Destination topic
        topic: &'static str,
        /// Payload
        message: CatalogMessage,
    },
    /// Index a product in the fast cache.
    CacheSet(Product),
}

impl Job {
    const fn kind(&self) -> &'static str {
        match self {
            Self::AppendLog(_) => "append_log",
            Self::Publish { .. } => "publish",
            Self::CacheSet(_) => "cache_set",
        }
    }
}

/// Why a job was not queued.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The queue is at capacity.
    #[error("Outbox queue is full")]
    Full,
    /// The worker has stopped.
    #[error("Outbox worker has stopped")]
    Closed,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    idle: Notify,
}

impl Counters {
    fn pending(&self) -> u64 {
        let done = self.completed.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst);
        self.submitted.load(Ordering::SeqCst).saturating_sub(done)
    }
}

/// Point-in-time view of the outbox counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutboxStats {
    /// Jobs accepted into the queue
    pub submitted: u64,
    /// Jobs that ran successfully
    pub completed: u64,
    /// Jobs that ran and failed
    pub failed: u64,
    /// Jobs refused because the queue was full or closed
    pub rejected: u64,
}

impl OutboxStats {
    /// Accepted jobs not yet executed.
    #[must_use]
    pub const fn pending(&self) -> u64 {
        self.submitted.saturating_sub(self.completed + self.failed)
    }
}

/// Where jobs are executed.
#[derive(Clone)]
pub struct OutboxTargets {
    /// Audit trail
    pub event_log: Arc<dyn EventLog>,
    /// Message bus
    pub bus: Arc<dyn EventBus>,
    /// Fast cache
    pub cache: Arc<dyn FastCache>,
}

/// Submission side of the queue. Cheap to clone.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Job>,
    counters: Arc<Counters>,
    notifier: Arc<dyn Notifier>,
}

impl Outbox {
    /// Create the queue and the worker that drains it.
    ///
    /// The worker does nothing until [`OutboxWorker::spawn`] or
    /// [`OutboxWorker::run`] is called.
    #[must_use]
    pub fn new(
        capacity: usize,
        targets: OutboxTargets,
        notifier: Arc<dyn Notifier>,
    ) -> (Self, OutboxWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let outbox = Self {
            tx,
            counters: Arc::clone(&counters),
            notifier: Arc::clone(&notifier),
        };
        let worker = OutboxWorker {
            rx,
            targets,
            counters,
            notifier,
        };
        (outbox, worker)
    }

    /// Queue a job without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError`] if the queue is full or the worker is gone.
    /// The caller's primary operation is unaffected; the rejection has
    /// already been logged and reported.
    pub fn submit(&self, job: Job) -> Result<(), SubmitError> {
        let kind = job.kind();
        // Count before sending so the worker can never observe completed > submitted.
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        let error = match self.tx.try_send(job) {
            Ok(()) => {
                metrics::counter!("outbox.submitted", "kind" => kind).increment(1);
                return Ok(());
            }
            Err(mpsc::error::TrySendError::Full(_)) => SubmitError::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SubmitError::Closed,
        };
        self.counters.submitted.fetch_sub(1, Ordering::SeqCst);
        self.counters.rejected.fetch_add(1, Ordering::SeqCst);
        self.counters.idle.notify_waiters();
        metrics::counter!("outbox.rejected", "kind" => kind).increment(1);
        tracing::error!(job = kind, error = %error, "Side effect dropped");

        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            alert(notifier.as_ref(), &format!("outbox dropped a {kind} job: {error}")).await;
        });
        Err(error)
    }

    /// Queue a publication. Encoding happens on the worker.
    pub fn publish(&self, topic: &'static str, message: CatalogMessage) {
        let _ = self.submit(Job::Publish { topic, message });
    }

    /// Queue a cache write.
    pub fn cache(&self, product: Product) {
        let _ = self.submit(Job::CacheSet(product));
    }

    /// Queue an audit record carrying a JSON snapshot of `state`.
    pub fn record<T: Serialize>(
        &self,
        aggregate_id: Uuid,
        message_type: MessageType,
        timestamp: DateTime<Utc>,
        state: &T,
    ) {
        match EventRecord::snapshot(aggregate_id, message_type, timestamp, state) {
            Ok(record) => {
                let _ = self.submit(Job::AppendLog(vec![record]));
            }
            Err(e) => {
                tracing::error!(
                    aggregate_id = %aggregate_id,
                    message_type = %message_type,
                    error = %e,
                    "Failed to snapshot state for the event log"
                );
            }
        }
    }

    /// Queue one audit record per item, all in a single append.
    ///
    /// Items that fail to serialize are logged and left out of the batch.
    pub fn record_each<T: Serialize>(
        &self,
        message_type: MessageType,
        timestamp: DateTime<Utc>,
        items: &[T],
        key: impl Fn(&T) -> Uuid,
    ) {
        let records: Vec<EventRecord> = items
            .iter()
            .filter_map(|item| {
                let aggregate_id = key(item);
                EventRecord::snapshot(aggregate_id, message_type, timestamp, item)
                    .inspect_err(|e| {
                        tracing::error!(
                            aggregate_id = %aggregate_id,
                            message_type = %message_type,
                            error = %e,
                            "Failed to snapshot state for the event log"
                        );
                    })
                    .ok()
            })
            .collect();
        if !records.is_empty() {
            let _ = self.submit(Job::AppendLog(records));
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> OutboxStats {
        OutboxStats {
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
        }
    }

    /// Wait until every accepted job has run.
    ///
    /// Returns immediately when nothing is pending. Only meaningful while a
    /// worker is running.
    pub async fn settle(&self) {
        loop {
            let idle = self.counters.idle.notified();
            if self.counters.pending() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Executes queued jobs one at a time.
pub struct OutboxWorker {
    rx: mpsc::Receiver<Job>,
    targets: OutboxTargets,
    counters: Arc<Counters>,
    notifier: Arc<dyn Notifier>,
}

impl OutboxWorker {
    /// Spawn the worker as a background task.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run until shutdown, then drain what is already queued.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("Outbox worker started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                job = self.rx.recv() => match job {
                    Some(job) => self.execute(job).await,
                    None => break,
                },
            }
        }

        self.rx.close();
        let mut drained = 0_u32;
        while let Some(job) = self.rx.recv().await {
            self.execute(job).await;
            drained += 1;
        }
        tracing::info!(drained, "Outbox worker stopped");
    }

    async fn execute(&self, job: Job) {
        let kind = job.kind();
        let result = match &job {
            Job::AppendLog(records) => self
                .targets
                .event_log
                .append(records)
                .await
                .map_err(|e| e.to_string()),
            Job::Publish { topic, message } => message
                .publish_to(self.targets.bus.as_ref(), topic)
                .await
                .map_err(|e| e.to_string()),
            Job::CacheSet(product) => self
                .targets
                .cache
                .set(product)
                .await
                .map_err(|e| e.to_string()),
        };

        match result {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::SeqCst);
                tracing::trace!(job = kind, "Side effect done");
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                metrics::counter!("outbox.failed", "kind" => kind).increment(1);
                tracing::error!(job = kind, error = %e, "Side effect failed");
                alert(self.notifier.as_ref(), &format!("{kind} failed: {e}")).await;
            }
        }
        self.counters.idle.notify_waiters();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use stockroom_core::command::UnbookStore;
    use stockroom_core::event_bus::topics;
    use stockroom_core::model::StoreId;
    use stockroom_testing::mocks::epoch;
    use stockroom_testing::{InMemoryCache, InMemoryEventBus, InMemoryEventLog, RecordingNotifier};
    use tokio_test::{assert_pending, assert_ready, task};

    struct Fixture {
        log: Arc<InMemoryEventLog>,
        bus: Arc<InMemoryEventBus>,
        cache: Arc<InMemoryCache>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture(capacity: usize) -> (Fixture, Outbox, OutboxWorker) {
        let fixture = Fixture {
            log: Arc::new(InMemoryEventLog::new()),
            bus: Arc::new(InMemoryEventBus::new()),
            cache: Arc::new(InMemoryCache::new()),
            notifier: Arc::new(RecordingNotifier::new()),
        };
        let targets = OutboxTargets {
            event_log: fixture.log.clone(),
            bus: fixture.bus.clone(),
            cache: fixture.cache.clone(),
        };
        let (outbox, worker) = Outbox::new(capacity, targets, fixture.notifier.clone());
        (fixture, outbox, worker)
    }

    fn unbook() -> CatalogMessage {
        CatalogMessage::UnbookStore(UnbookStore::new(StoreId::new()))
    }

    #[tokio::test]
    async fn jobs_run_in_order_and_are_counted() {
        let (fx, outbox, worker) = fixture(16);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let _worker = worker.spawn(shutdown_rx);

        outbox.publish(topics::STORE_UNBOOK_LEDGER, unbook());
        outbox.record(Uuid::new_v4(), MessageType::StoreUnbook, epoch(), &"snapshot");
        outbox.settle().await;

        assert_eq!(fx.bus.messages_on(topics::STORE_UNBOOK_LEDGER).len(), 1);
        assert_eq!(fx.log.records().len(), 1);
        assert_eq!(fx.log.records()[0].data, "\"snapshot\"");
        let stats = outbox.stats();
        assert_eq!((stats.submitted, stats.completed, stats.failed), (2, 2, 0));
        assert_eq!(stats.pending(), 0);
    }

    #[tokio::test]
    async fn failed_job_is_counted_and_reported() {
        let (fx, outbox, worker) = fixture(16);
        fx.bus.set_failing(true);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let _worker = worker.spawn(shutdown_rx);

        outbox.publish(topics::ORDER_STATUS, unbook());
        outbox.settle().await;

        assert_eq!(outbox.stats().failed, 1);
        assert!(fx.notifier.messages()[0].starts_with("publish failed"));
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let (_fx, outbox, _worker) = fixture(1);

        assert_eq!(outbox.submit(Job::AppendLog(vec![])), Ok(()));
        assert_eq!(outbox.submit(Job::AppendLog(vec![])), Err(SubmitError::Full));

        let stats = outbox.stats();
        assert_eq!((stats.submitted, stats.rejected), (1, 1));
    }

    #[tokio::test]
    async fn shutdown_drains_queued_jobs() {
        let (fx, outbox, worker) = fixture(16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        outbox.publish(topics::STORE_UNBOOK_LEDGER, unbook());
        outbox.publish(topics::STORE_UNBOOK_LEDGER, unbook());
        shutdown_tx.send(()).unwrap();
        worker.run(shutdown_rx).await;

        assert_eq!(fx.bus.messages_on(topics::STORE_UNBOOK_LEDGER).len(), 2);
        assert_eq!(outbox.stats().completed, 2);
    }

    #[test]
    fn settle_returns_at_once_when_idle() {
        let (_fx, outbox, _worker) = fixture(4);
        let mut settle = task::spawn(outbox.settle());
        assert_ready!(settle.poll());
    }

    #[tokio::test]
    async fn settle_waits_for_queued_jobs() {
        let (fx, outbox, worker) = fixture(4);
        outbox.publish(topics::STORE_UNBOOK_LEDGER, unbook());

        let mut settle = task::spawn(outbox.settle());
        assert_pending!(settle.poll());

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let _worker = worker.spawn(shutdown_rx);
        outbox.settle().await;

        assert!(settle.is_woken());
        assert_ready!(settle.poll());
        assert_eq!(fx.bus.messages_on(topics::STORE_UNBOOK_LEDGER).len(), 1);
    }

    #[tokio::test]
    async fn record_each_appends_one_batch() {
        let (fx, outbox, worker) = fixture(4);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let _worker = worker.spawn(shutdown_rx);
        let keys = [Uuid::new_v4(), Uuid::new_v4()];

        outbox.record_each(MessageType::StoreBook, epoch(), &keys, |key| *key);
        outbox.settle().await;

        let records = fx.log.records();
        assert_eq!(records.iter().map(|r| r.aggregate_id).collect::<Vec<_>>(), keys);
        assert_eq!(outbox.stats().completed, 1);
    }
}
