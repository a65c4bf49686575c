//! Message bus abstraction.
//!
//! Every committed ledger mutation fans out through the bus: replica and cache
//! updates, slot allocation after a product is created, compensating unbooks
//! from the expiry watchdog, and notifications to the order subsystem.
//!
//! ```text
//!  command ──▶ ledger commit ──▶ publish ──┬──▶ *-replica topics ──▶ replica + cache
//!                                          ├──▶ *-ledger topics  ──▶ reservation engine
//!                                          └──▶ orders.*         ──▶ order subsystem
//! ```
//!
//! Delivery is at-least-once. A subscriber acknowledges each [`Delivery`]
//! once it has been processed; an unacknowledged delivery is redelivered.
//! Replica consumers overwrite rather than merge, so a redelivered message
//! converges to the same state.

use crate::event::SerializedEvent;
use futures::Stream;
use futures::channel::oneshot;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use thiserror::Error;

/// Topic names.
///
/// Names use dots and dashes only so they are valid Kafka topic names.
pub mod topics {
    /// Product snapshot to write into the replica and cache.
    pub const PRODUCT_CREATE_REPLICA: &str = "catalog.product.create-replica";
    /// Updated product snapshot for the replica and cache.
    pub const PRODUCT_UPDATE_REPLICA: &str = "catalog.product.update-replica";
    /// Allocate slots in the ledger.
    pub const STORE_CREATE_LEDGER: &str = "catalog.store.create-ledger";
    /// Newly allocated slots for the replica.
    pub const STORE_CREATE_REPLICA: &str = "catalog.store.create-replica";
    /// Book slots in the ledger (sent by the order subsystem).
    pub const STORE_BOOK_LEDGER: &str = "catalog.store.book-ledger";
    /// Booked slots for the replica.
    pub const STORE_BOOK_REPLICA: &str = "catalog.store.book-replica";
    /// Release a slot in the ledger.
    pub const STORE_UNBOOK_LEDGER: &str = "catalog.store.unbook-ledger";
    /// Released slots for the replica.
    pub const STORE_UNBOOK_REPLICA: &str = "catalog.store.unbook-replica";
    /// Sell slots in the ledger.
    pub const STORE_PAYMENT_LEDGER: &str = "catalog.store.payment-ledger";
    /// Sold slots for the replica.
    pub const STORE_PAYMENT_REPLICA: &str = "catalog.store.payment-replica";
    /// Order status changes consumed by the order subsystem.
    pub const ORDER_STATUS: &str = "orders.status";
    /// Booked slots attached to an order.
    pub const ORDER_STORE_BOOKED: &str = "orders.store-booked";

    /// Topics that carry commands for the ledger.
    pub const LEDGER_COMMANDS: [&str; 4] = [
        STORE_CREATE_LEDGER,
        STORE_BOOK_LEDGER,
        STORE_UNBOOK_LEDGER,
        STORE_PAYMENT_LEDGER,
    ];

    /// Topics that carry snapshots for the replica and cache.
    pub const REPLICA_UPDATES: [&str; 6] = [
        PRODUCT_CREATE_REPLICA,
        PRODUCT_UPDATE_REPLICA,
        STORE_CREATE_REPLICA,
        STORE_BOOK_REPLICA,
        STORE_UNBOOK_REPLICA,
        STORE_PAYMENT_REPLICA,
    ];
}

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics.
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// A received payload could not be decoded.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Consumer group coordination failed.
    #[error("Consumer group error: {0}")]
    ConsumerGroupError(String),

    /// Network or transport failure.
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// One received event and the acknowledgement owed for it.
///
/// Dropping a tracked delivery without calling [`Delivery::ack`] tells the
/// transport the event was not processed. The transport then stops at that
/// event and hands it out again on the next subscription.
#[derive(Debug)]
pub struct Delivery {
    event: SerializedEvent,
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    /// A delivery that needs no acknowledgement.
    #[must_use]
    pub const fn new(event: SerializedEvent) -> Self {
        Self { event, ack: None }
    }

    /// A delivery whose acknowledgement resolves the returned receiver.
    ///
    /// The receiver yields `Err(Canceled)` if the delivery is dropped unacked.
    #[must_use]
    pub fn tracked(event: SerializedEvent) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { event, ack: Some(tx) }, rx)
    }

    /// The received event.
    #[must_use]
    pub const fn event(&self) -> &SerializedEvent {
        &self.event
    }

    /// Mark the event as processed.
    pub fn ack(mut self) {
        if let Some(tx) = self.ack.take() {
            // The transport may already have moved on.
            let _ = tx.send(());
        }
    }
}

impl Deref for Delivery {
    type Target = SerializedEvent;

    fn deref(&self) -> &SerializedEvent {
        &self.event
    }
}

/// Stream of events delivered by a subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Publish/subscribe transport with at-least-once delivery.
///
/// Subscribers share the consumer group configured on the implementation, so
/// several service instances split a topic's partitions between them.
/// Offsets are committed only after the subscriber acknowledges a
/// [`Delivery`].
pub trait EventBus: Send + Sync {
    /// Publish an event to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker rejects the
    /// message or the send times out.
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the subscription
    /// cannot be established.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn event() -> SerializedEvent {
        SerializedEvent::new("UnbookStore.v1".to_string(), vec![1, 2, 3])
    }

    #[test]
    fn ack_resolves_the_receiver() {
        let (delivery, acked) = Delivery::tracked(event());
        assert_eq!(delivery.event_type, "UnbookStore.v1");

        delivery.ack();
        assert_eq!(tokio_test::block_on(acked), Ok(()));
    }

    #[test]
    fn dropping_unacked_cancels_the_receiver() {
        let (delivery, acked) = Delivery::tracked(event());
        drop(delivery);

        assert_eq!(tokio_test::block_on(acked), Err(oneshot::Canceled));
    }

    #[test]
    fn untracked_delivery_acks_silently() {
        let delivery = Delivery::new(event());
        assert_eq!(delivery.event().data, vec![1, 2, 3]);
        delivery.ack();
    }
}
