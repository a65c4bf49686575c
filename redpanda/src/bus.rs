//! Producer side and subscription setup.

use crate::forward::forward;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use stockroom_core::event::SerializedEvent;
use stockroom_core::event_bus::{EventBus, EventBusError, EventStream};

const DEFAULT_BUFFER: usize = 1000;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Message bus backed by a Kafka-compatible broker.
///
/// One producer is shared by every publisher; each [`EventBus::subscribe`]
/// call creates its own consumer in the configured group.
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Bus with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring a bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn group_for(&self, topics: &[String]) -> String {
        self.consumer_group.clone().unwrap_or_else(|| {
            let mut sorted = topics.to_vec();
            sorted.sort();
            format!("stockroom-{}", sorted.join("-"))
        })
    }
}

/// Builder for [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    acks: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgement mode, `"all"` by default.
    #[must_use]
    pub fn acks(mut self, acks: impl Into<String>) -> Self {
        self.acks = Some(acks.into());
        self
    }

    /// Producer send timeout, 5 seconds by default.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group shared by every instance of the service.
    ///
    /// Without one, the group is derived from the subscribed topics.
    #[must_use]
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    /// Records buffered between the consumer task and the subscriber.
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size.max(1));
        self
    }

    /// Where a new group starts reading: `"earliest"` or `"latest"` (default).
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Create the producer.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are missing or
    /// the producer configuration is rejected.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.acks.unwrap_or_else(|| "all".to_string());

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", &acks)
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let bus = RedpandaEventBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            consumer_group: self.consumer_group,
            buffer_size: self.buffer_size.unwrap_or(DEFAULT_BUFFER),
            auto_offset_reset: self.auto_offset_reset.unwrap_or_else(|| "latest".to_string()),
        };

        tracing::info!(
            brokers = %bus.brokers,
            acks = %acks,
            consumer_group = ?bus.consumer_group,
            "Message bus ready"
        );
        Ok(bus)
    }
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let payload = bincode::serialize(event);
        let key = event.event_type.clone();

        Box::pin(async move {
            let payload = payload.map_err(|e| EventBusError::PublishFailed {
                topic: topic.clone(),
                reason: format!("Failed to serialize event: {e}"),
            })?;
            let record = FutureRecord::to(&topic).payload(&payload).key(key.as_bytes());

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(topic = %topic, partition, offset, event_type = %key, "Event published");
                    Ok(())
                }
                Err((e, _)) => {
                    tracing::error!(topic = %topic, error = %e, "Failed to publish event");
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: e.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();

        Box::pin(async move {
            let group = self.group_for(&topics);
            let failed = |reason: String| EventBusError::SubscriptionFailed {
                topics: topics.clone(),
                reason,
            };

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| failed(format!("Failed to create consumer: {e}")))?;

            let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&refs)
                .map_err(|e| failed(format!("Failed to subscribe to topics: {e}")))?;

            tracing::info!(topics = ?topics, consumer_group = %group, "Subscribed to topics");

            let (tx, mut rx) = tokio::sync::mpsc::channel(self.buffer_size);
            tokio::spawn(forward(consumer, tx));

            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }
}
