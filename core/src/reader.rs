//! Read capability shared by every product tier.

use crate::BoxFuture;
use crate::error::StorageError;
use crate::model::{Product, ProductId};

/// Listing filter and page window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    /// Case-insensitive name fragment; blank lists everything
    pub name: String,
    /// 1-based page number
    pub page: u32,
    /// Page size
    pub size: u32,
}

impl ListQuery {
    /// Build a query, clamping `page` and `size` to at least 1.
    #[must_use]
    pub fn new(name: impl Into<String>, page: u32, size: u32) -> Self {
        Self {
            name: name.into(),
            page: page.max(1),
            size: size.max(1),
        }
    }

    /// Trimmed name filter, or `None` when listing everything.
    #[must_use]
    pub fn name_filter(&self) -> Option<&str> {
        let name = self.name.trim();
        (!name.is_empty()).then_some(name)
    }

    /// Number of rows to skip.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.size)
    }
}

impl Default for ListQuery {
    fn default() -> Self {
        Self::new("", 1, 20)
    }
}

/// Point and listing reads over non-deleted products.
///
/// Implemented by the ledger, the replica and the fast cache so the read
/// repository can treat them as an ordered list of interchangeable tiers.
pub trait ProductReader: Send + Sync {
    /// Look a product up by id.
    fn get_by_id(&self, id: ProductId) -> BoxFuture<'_, Result<Option<Product>, StorageError>>;

    /// Look a product up by slug.
    fn get_by_slug<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Result<Option<Product>, StorageError>>;

    /// List products ordered by name.
    fn list<'a>(&'a self, query: &'a ListQuery) -> BoxFuture<'a, Result<Vec<Product>, StorageError>>;
}
