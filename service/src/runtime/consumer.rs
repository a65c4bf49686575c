//! Bus consumer with automatic reconnection.
//!
//! ```text
//! loop {
//!     subscribe ──err──▶ wait retry_delay
//!        │
//!        ▼
//!     for each delivery: handler.handle()
//!        ├─ Ok                        ──▶ ack
//!        ├─ infrastructure / version  ──▶ leave unacked, wait retry_delay, resubscribe
//!        └─ any other error           ──▶ log, ack
//!        │
//!     stream ended ──▶ wait retry_delay, resubscribe
//! }
//! ```
//!
//! An unacknowledged delivery is handed out again by the transport once the
//! consumer resubscribes. A shutdown broadcast interrupts any of the waits.

use crate::handlers::EventHandler;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use stockroom_core::error::CatalogError;
use stockroom_core::event_bus::{Delivery, EventBus, EventStream};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Subscribes a handler to a set of topics.
pub struct EventConsumer {
    name: String,
    topics: Vec<&'static str>,
    event_bus: Arc<dyn EventBus>,
    handler: Arc<dyn EventHandler>,
    retry_delay: Duration,
}

impl EventConsumer {
    /// Consumer with the default 5 second retry delay.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        topics: &[&'static str],
        event_bus: Arc<dyn EventBus>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            topics: topics.to_vec(),
            event_bus,
            handler,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Override the reconnection delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Consumer name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the subscribe-process-reconnect loop.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(consumer = %self.name, topics = ?self.topics, "Event consumer started");

        loop {
            let stream = tokio::select! {
                _ = shutdown.recv() => break,
                result = self.event_bus.subscribe(&self.topics) => result,
            };

            match stream {
                Ok(stream) => {
                    info!(consumer = %self.name, "Subscribed to event bus");
                    if self.process(stream, &mut shutdown).await {
                        break;
                    }
                    warn!(consumer = %self.name, retry_in = ?self.retry_delay, "Event stream ended, reconnecting");
                }
                Err(e) => {
                    error!(
                        consumer = %self.name,
                        error = %e,
                        retry_in = ?self.retry_delay,
                        "Failed to subscribe to event bus"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        info!(consumer = %self.name, "Event consumer stopped");
    }

    /// Drain the stream. Returns `true` if shutdown was requested, `false`
    /// when the stream ended or a delivery was left for redelivery.
    async fn process(&self, mut stream: EventStream, shutdown: &mut broadcast::Receiver<()>) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return true,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        if !self.dispatch(delivery).await {
                            return false;
                        }
                    }
                    Some(Err(e)) => {
                        error!(consumer = %self.name, error = %e, "Error receiving event from stream");
                    }
                    None => return false,
                },
            }
        }
    }

    /// Handle one delivery. Returns `false` if it was left unacknowledged.
    async fn dispatch(&self, delivery: Delivery) -> bool {
        let handled = self.handler.handle(&delivery.data).await;
        match handled {
            Ok(()) => {
                delivery.ack();
                true
            }
            Err(e) if redeliverable(&e) => {
                warn!(
                    consumer = %self.name,
                    event_type = %delivery.event_type,
                    error = %e,
                    "Event not processed, leaving it for redelivery"
                );
                metrics::counter!("consumer.redeliveries", "consumer" => self.name.clone()).increment(1);
                false
            }
            Err(e) => {
                error!(
                    consumer = %self.name,
                    event_type = %delivery.event_type,
                    error = %e,
                    "Failed to handle event"
                );
                metrics::counter!("consumer.handler_errors", "consumer" => self.name.clone()).increment(1);
                delivery.ack();
                true
            }
        }
    }
}

/// Whether processing may succeed if the same payload is tried again later.
fn redeliverable(err: &CatalogError) -> bool {
    err.is_retryable() || matches!(err, CatalogError::Infrastructure(_))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt as _;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use stockroom_core::command::UnbookStore;
    use stockroom_core::event::SerializedEvent;
    use stockroom_core::event_bus::EventBusError;
    use stockroom_core::message::CatalogMessage;
    use stockroom_core::model::StoreId;
    use stockroom_testing::InMemoryEventBus;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<CatalogMessage>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, data: &[u8]) -> Result<(), CatalogError> {
            self.seen.lock().unwrap().push(CatalogMessage::decode(data)?);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_published_messages_and_stops_on_shutdown() {
        let bus = Arc::new(InMemoryEventBus::new());
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = broadcast::channel(1);
        let consumer = EventConsumer::new("test", &["t"], bus.clone(), recorder.clone())
            .with_retry_delay(Duration::from_millis(10));
        let handle = consumer.spawn(rx);

        // Give the consumer a chance to subscribe.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let msg = CatalogMessage::UnbookStore(UnbookStore::new(StoreId::new()));
        msg.publish_to(bus.as_ref(), "t").await.unwrap();

        for _ in 0..50 {
            if !recorder.seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.seen.lock().unwrap().clone(), vec![msg]);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    /// Bus holding one event that every new subscription hands out again
    /// until some subscriber acknowledges it.
    struct RedeliveringBus {
        event: SerializedEvent,
        acked: Arc<AtomicBool>,
        subscriptions: AtomicU32,
    }

    impl RedeliveringBus {
        fn new() -> Self {
            let msg = CatalogMessage::UnbookStore(UnbookStore::new(StoreId::new()));
            Self {
                event: msg.encode().unwrap(),
                acked: Arc::new(AtomicBool::new(false)),
                subscriptions: AtomicU32::new(0),
            }
        }
    }

    impl EventBus for RedeliveringBus {
        fn publish(
            &self,
            _topic: &str,
            _event: &SerializedEvent,
        ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn subscribe(
            &self,
            _topics: &[&str],
        ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            let stream: EventStream = if self.acked.load(Ordering::SeqCst) {
                Box::pin(futures::stream::pending())
            } else {
                let (delivery, ack) = Delivery::tracked(self.event.clone());
                let acked = Arc::clone(&self.acked);
                tokio::spawn(async move {
                    if ack.await.is_ok() {
                        acked.store(true, Ordering::SeqCst);
                    }
                });
                Box::pin(futures::stream::iter([Ok(delivery)]).chain(futures::stream::pending()))
            };
            Box::pin(async move { Ok(stream) })
        }
    }

    /// Fails the first `failures` calls with `error`, then succeeds.
    struct Flaky {
        failures: AtomicU32,
        error: CatalogError,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, error: CatalogError) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                error,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EventHandler for Flaky {
        async fn handle(&self, _data: &[u8]) -> Result<(), CatalogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing { Err(self.error.clone()) } else { Ok(()) }
        }
    }

    async fn run_until_acked(bus: &Arc<RedeliveringBus>, handler: &Arc<Flaky>) {
        let (tx, rx) = broadcast::channel(1);
        let consumer = EventConsumer::new("test", &["t"], bus.clone(), handler.clone())
            .with_retry_delay(Duration::from_millis(10));
        let handle = consumer.spawn(rx);

        for _ in 0..100 {
            if bus.acked.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn infrastructure_failure_leaves_the_event_for_redelivery() {
        let bus = Arc::new(RedeliveringBus::new());
        let handler = Arc::new(Flaky::new(
            1,
            CatalogError::Infrastructure("ledger unavailable".to_string()),
        ));

        run_until_acked(&bus, &handler).await;

        assert!(bus.acked.load(Ordering::SeqCst));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.subscriptions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejected_event_is_acknowledged_and_not_redelivered() {
        let bus = Arc::new(RedeliveringBus::new());
        let handler = Arc::new(Flaky::new(1, CatalogError::not_found("store id: x not found")));

        run_until_acked(&bus, &handler).await;

        assert!(bus.acked.load(Ordering::SeqCst));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriptions.load(Ordering::SeqCst), 1);
    }
}
