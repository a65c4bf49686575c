//! Search-indexed fast cache of products.

use crate::BoxFuture;
use crate::error::StorageError;
use crate::model::Product;
use crate::reader::ProductReader;

/// Fast cache.
pub trait FastCache: ProductReader {
    /// Index or re-index a single product.
    fn set<'a>(&'a self, product: &'a Product) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Drop every cached product and index `products` from scratch.
    fn refresh<'a>(&'a self, products: &'a [Product]) -> BoxFuture<'a, Result<(), StorageError>>;
}
