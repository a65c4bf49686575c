//! Kafka/Redpanda message bus for Stockroom.
//!
//! Every catalog topic carries a bincode-encoded
//! [`SerializedEvent`](stockroom_core::event::SerializedEvent). The record key
//! is the event type, so events of one kind stay ordered within a partition.
//!
//! Delivery is at-least-once: a consumed offset is committed only after the
//! subscriber acknowledges the
//! [`Delivery`](stockroom_core::event_bus::Delivery). Consumers of the
//! `*-ledger` topics must therefore tolerate redelivery, which the ledger's
//! version guard provides.
//!
//! # Example
//!
//! ```no_run
//! use stockroom_redpanda::RedpandaEventBus;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("products-service")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

mod bus;
mod forward;

pub use bus::{RedpandaEventBus, RedpandaEventBusBuilder};
