//! Replica store for Stockroom.
//!
//! # Overview
//!
//! The replica is a read-optimised copy of products and slots, kept in a
//! database separate from the durable ledger and written only by the bus
//! consumers that follow ledger commits:
//!
//! ```text
//! Ledger DB (write)   →  message bus  →  Replica DB (read)
//! products, stores                        products, stores
//! ```
//!
//! Every replication event overwrites the row wholesale. The replica never
//! merges and never checks versions; the ledger is the only authority.
//!
//! # Example
//!
//! ```ignore
//! use stockroom_projections::PostgresReplicaStore;
//!
//! let replica = PostgresReplicaStore::new_with_separate_db("postgres://localhost/replica").await?;
//! replica.migrate().await?;
//! ```

pub mod replica;

pub use replica::PostgresReplicaStore;
