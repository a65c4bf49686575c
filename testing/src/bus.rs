//! In-memory event bus.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use stockroom_core::event::SerializedEvent;
use stockroom_core::event_bus::{Delivery, EventBus, EventBusError, EventStream};
use stockroom_core::message::CatalogMessage;
use tokio::sync::{broadcast, mpsc};

const CHANNEL_CAPACITY: usize = 1024;

/// Broadcast-backed bus that also records every published event.
///
/// Subscribers only see events published after they subscribed, like a Kafka
/// consumer starting at the latest offset. Deliveries are untracked:
/// acknowledging one is a no-op and nothing is redelivered.
pub struct InMemoryEventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<SerializedEvent>>>,
    published: Mutex<Vec<(String, SerializedEvent)>>,
    failing: AtomicBool,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    /// Empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every publish fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every event published so far, with its topic.
    #[must_use]
    pub fn published(&self) -> Vec<(String, SerializedEvent)> {
        self.published.lock().unwrap().clone()
    }

    /// Decoded messages published to `topic`, in order.
    #[must_use]
    pub fn messages_on(&self, topic: &str) -> Vec<CatalogMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, event)| CatalogMessage::decode(&event.data).ok())
            .collect()
    }

    /// Forget recorded events.
    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<SerializedEvent> {
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let result = if self.failing.load(Ordering::SeqCst) {
            Err(EventBusError::PublishFailed {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            })
        } else {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), event.clone()));
            // No receivers is fine: the event is still recorded.
            let _ = self.sender(topic).send(event.clone());
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let receivers: Vec<_> = topics.iter().map(|t| self.sender(t).subscribe()).collect();

        Box::pin(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            for mut receiver in receivers {
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        match receiver.recv().await {
                            Ok(event) => {
                                if tx.send(Ok(Delivery::new(event))).is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
            }

            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }
}
