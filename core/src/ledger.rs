//! Durable ledger: the authoritative record of products and slots.
//!
//! Every mutation is a compare-and-swap on the row's `version`: the caller
//! hands over the entity with its version already incremented, and the ledger
//! applies it only if the stored row still carries `version - 1`. An update
//! that matches no row is reported as [`StorageError::VersionConflict`],
//! never as silent success.

use crate::BoxFuture;
use crate::error::StorageError;
use crate::model::{Product, ProductId, Store, StoreId};
use crate::reader::ProductReader;
use chrono::{DateTime, Utc};

/// Product rows.
pub trait ProductLedger: ProductReader {
    /// Insert a new product at version 0.
    ///
    /// # Errors
    ///
    /// [`StorageError::Duplicate`] if the id, name or slug is taken.
    fn insert_product<'a>(&'a self, product: &'a Product) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Apply an update conditioned on `product.version - 1`.
    ///
    /// # Errors
    ///
    /// [`StorageError::VersionConflict`] if the stored version differs.
    fn update_product<'a>(&'a self, product: &'a Product) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Find a non-deleted product by exact name.
    fn find_product_by_name<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Product>, StorageError>>;
}

/// Slot rows.
pub trait StoreLedger: Send + Sync {
    /// Insert a batch of slots; either all rows land or none do.
    fn insert_stores<'a>(&'a self, stores: &'a [Store]) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Find a non-deleted slot.
    fn find_store(&self, id: StoreId) -> BoxFuture<'_, Result<Option<Store>, StorageError>>;

    /// Up to `limit` slots available at `now`, oldest first.
    fn available_stores(
        &self,
        product_id: ProductId,
        limit: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Store>, StorageError>>;

    /// Apply a batch of transitions atomically, each conditioned on its
    /// previous version.
    ///
    /// # Errors
    ///
    /// [`StorageError::VersionConflict`] naming the first stale slot; no row
    /// of the batch is changed in that case.
    fn update_stores<'a>(&'a self, stores: &'a [Store]) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Unsold, undeleted slots whose hold has not yet expired at `now`.
    fn booked_stores(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<Vec<Store>, StorageError>>;
}
