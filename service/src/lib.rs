//! # Stockroom
//!
//! Inventory reservation and cross-store consistency service.
//!
//! A product is sold through discrete slots held in a durable ledger. Writes
//! commit to the ledger first; everything downstream (event log, replica,
//! fast cache, order notifications) follows asynchronously through the
//! message bus and the outbox.
//!
//! ```text
//!  command ──▶ Catalog ──▶ ProductCommands / ReservationEngine ──▶ ledger
//!                                      │
//!                                      └──▶ Outbox ──▶ event log, bus, cache
//!
//!  bus ──▶ ledger consumer  ──▶ ReservationEngine
//!  bus ──▶ replica consumer ──▶ replica ──▶ cache
//!
//!  Watchdog: expired holds ──▶ unbook commands on the bus
//!  CacheRebuildScheduler: replica ──▶ cache, once a day
//! ```
//!
//! Reads go through [`read_repository::ProductRepository`], which falls back
//! tier by tier and repairs faster tiers from slower hits.

pub mod bootstrap;
pub mod catalog;
pub mod config;
pub mod handlers;
pub mod notifier;
pub mod outbox;
pub mod pipeline;
pub mod read_repository;
pub mod rebuild;
pub mod reservation;
pub mod runtime;
pub mod watchdog;

pub use bootstrap::{Collaborators, Stockroom, connect};
pub use catalog::Catalog;
pub use config::Config;
