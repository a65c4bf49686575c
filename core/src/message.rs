//! Bus payloads.
//!
//! A single [`CatalogMessage`] enum travels on every topic; the topic decides
//! which consumer sees it, the variant decides what the consumer does.

use crate::command::{BookStores, CreateStores, PayStores, UnbookStore};
use crate::event::{Event, SerializedEvent};
use crate::event_bus::{EventBus, EventBusError};
use crate::model::{MessageType, OrderId, Product, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata shared by every domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Aggregate the event belongs to
    pub aggregate_id: Uuid,
    /// Mutation kind
    pub message_type: MessageType,
    /// Commit time
    pub timestamp: DateTime<Utc>,
}

/// Order status values understood by the order subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// The order cannot be fulfilled
    Canceled,
}

/// Everything that crosses the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CatalogMessage {
    /// A product was committed to the ledger
    ProductCreated {
        /// Event metadata
        meta: EventMeta,
        /// Committed snapshot
        product: Product,
    },
    /// A product update was committed to the ledger
    ProductUpdated {
        /// Event metadata
        meta: EventMeta,
        /// Committed snapshot
        product: Product,
    },
    /// Command: allocate slots
    CreateStores(CreateStores),
    /// Slots were allocated
    StoresCreated {
        /// Event metadata
        meta: EventMeta,
        /// Allocated slots
        stores: Vec<Store>,
    },
    /// Command: hold slots for an order
    BookStores(BookStores),
    /// Slots were booked
    StoresBooked {
        /// Event metadata
        meta: EventMeta,
        /// Order that holds the slots
        order_id: OrderId,
        /// Booked slots
        stores: Vec<Store>,
    },
    /// Command: release a slot
    UnbookStore(UnbookStore),
    /// A slot was released
    StoresUnbooked {
        /// Event metadata
        meta: EventMeta,
        /// Released slots
        stores: Vec<Store>,
    },
    /// Command: settle payment
    PayStores(PayStores),
    /// Slots were sold
    StoresPaid {
        /// Event metadata
        meta: EventMeta,
        /// Sold slots
        stores: Vec<Store>,
    },
    /// Notification to the order subsystem
    OrderStatusChanged {
        /// Affected order
        order_id: OrderId,
        /// New status
        status: OrderStatus,
        /// When the status changed
        status_at: DateTime<Utc>,
    },
    /// Booked slots handed to the order subsystem
    StoreOrderUpdate {
        /// Affected order
        order_id: OrderId,
        /// Slots held for it
        stores: Vec<Store>,
    },
}

impl Event for CatalogMessage {
    fn event_type(&self) -> &'static str {
        match self {
            Self::ProductCreated { .. } => "ProductCreated.v1",
            Self::ProductUpdated { .. } => "ProductUpdated.v1",
            Self::CreateStores(_) => "CreateStores.v1",
            Self::StoresCreated { .. } => "StoresCreated.v1",
            Self::BookStores(_) => "BookStores.v1",
            Self::StoresBooked { .. } => "StoresBooked.v1",
            Self::UnbookStore(_) => "UnbookStore.v1",
            Self::StoresUnbooked { .. } => "StoresUnbooked.v1",
            Self::PayStores(_) => "PayStores.v1",
            Self::StoresPaid { .. } => "StoresPaid.v1",
            Self::OrderStatusChanged { .. } => "OrderStatusChanged.v1",
            Self::StoreOrderUpdate { .. } => "StoreOrderUpdate.v1",
        }
    }
}

impl CatalogMessage {
    /// Encode for the bus.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::DeserializationFailed`] if encoding fails.
    pub fn encode(&self) -> Result<SerializedEvent, EventBusError> {
        SerializedEvent::from_event(self)
            .map_err(|e| EventBusError::DeserializationFailed(e.to_string()))
    }

    /// Decode a payload received from the bus.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::DeserializationFailed`] if the bytes are not a
    /// `CatalogMessage`.
    pub fn decode(data: &[u8]) -> Result<Self, EventBusError> {
        Self::from_bytes(data).map_err(|e| EventBusError::DeserializationFailed(e.to_string()))
    }

    /// Encode and publish in one step.
    ///
    /// # Errors
    ///
    /// Returns the encoding or publish error.
    pub async fn publish_to(&self, bus: &dyn EventBus, topic: &str) -> Result<(), EventBusError> {
        let event = self.encode()?;
        bus.publish(topic, &event).await
    }
}
