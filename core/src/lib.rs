//! # Stockroom Core
//!
//! Domain model and collaborator traits for the Stockroom inventory engine.
//!
//! A product is sold through discrete inventory slots ("stores"). Every slot
//! lives authoritatively in the durable ledger and is mirrored into a replica
//! store and a search-indexed fast cache by asynchronous messages.
//!
//! ## Layers
//!
//! - [`model`]: products, slots and event-log records, plus the slot state machine
//! - [`command`] / [`message`]: typed commands and the bus payloads they produce
//! - [`error`]: storage errors and the caller-facing [`error::CatalogError`] taxonomy
//! - [`ledger`], [`event_log`], [`replica`], [`cache`], [`reader`]: storage seams
//! - [`event_bus`], [`notifier`], [`validation`]: external collaborators
//!
//! Every async seam returns a boxed future so the traits stay dyn-compatible and
//! implementations can be swapped behind `Arc<dyn Trait>`.

use std::future::Future;
use std::pin::Pin;

pub use chrono::{DateTime, Utc};

pub mod cache;
pub mod command;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod event_log;
pub mod ledger;
pub mod message;
pub mod model;
pub mod notifier;
pub mod reader;
pub mod replica;
pub mod validation;

/// Boxed, sendable future returned by every storage and collaborator trait.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Time source abstraction.
///
/// Domain code never calls `Utc::now()` directly; hold windows, expiry scans
/// and rebuild scheduling all read the injected clock.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
