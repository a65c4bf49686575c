//! `PostgreSQL` durable ledger and event log for Stockroom.
//!
//! The ledger is the only authority for product and slot versions. Every
//! update is conditioned on the row's previous version and checks the
//! affected-row count, so a lost race is always reported as
//! [`StorageError::VersionConflict`](stockroom_core::error::StorageError).
//!
//! # Example
//!
//! ```ignore
//! use stockroom_postgres::{PostgresEventLog, PostgresLedger};
//!
//! let ledger = PostgresLedger::connect("postgres://localhost/stockroom", 10).await?;
//! ledger.migrate().await?;
//! let event_log = PostgresEventLog::connect("postgres://localhost/stockroom_events").await?;
//! event_log.migrate().await?;
//! ```

mod event_log;
mod ledger;
pub mod rows;

pub use event_log::PostgresEventLog;
pub use ledger::PostgresLedger;
