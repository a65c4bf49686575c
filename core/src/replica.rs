//! Read-optimized secondary copy of products and slots.
//!
//! The replica has no version authority of its own: every replication
//! message overwrites the stored copy with the ledger's snapshot.

use crate::BoxFuture;
use crate::error::StorageError;
use crate::model::{Product, Store};
use crate::reader::ProductReader;

/// Replica store.
pub trait ReplicaStore: ProductReader {
    /// Insert or overwrite a product.
    fn upsert_product<'a>(&'a self, product: &'a Product) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Insert or overwrite slots.
    fn upsert_stores<'a>(&'a self, stores: &'a [Store]) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Every non-deleted product, with derived quantities.
    fn all_products(&self) -> BoxFuture<'_, Result<Vec<Product>, StorageError>>;
}
