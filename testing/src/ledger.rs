//! In-memory durable ledger.

use crate::FailureSwitch;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use stockroom_core::BoxFuture;
use stockroom_core::environment::{Clock, SystemClock};
use stockroom_core::error::StorageError;
use stockroom_core::ledger::{ProductLedger, StoreLedger};
use stockroom_core::model::{Product, ProductId, Store, StoreId};
use stockroom_core::reader::{ListQuery, ProductReader};

#[derive(Default)]
struct Tables {
    products: HashMap<ProductId, Product>,
    /// Insertion order doubles as creation order.
    stores: Vec<Store>,
}

/// Ledger backed by a mutex-guarded map, with the same version-guard
/// semantics as the Postgres ledger.
pub struct InMemoryLedger {
    tables: Mutex<Tables>,
    clock: Arc<dyn Clock>,
    failure: FailureSwitch,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    /// Empty ledger using the system clock for derived quantities.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty ledger that derives quantities against `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            clock,
            failure: FailureSwitch::default(),
        }
    }

    /// Make every call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failure.set(failing);
    }

    /// Snapshot of one slot, deleted or not.
    #[must_use]
    pub fn store(&self, id: StoreId) -> Option<Store> {
        self.tables
            .lock()
            .unwrap()
            .stores
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    /// Every slot of a product, in creation order.
    #[must_use]
    pub fn stores_of(&self, product_id: ProductId) -> Vec<Store> {
        self.tables
            .lock()
            .unwrap()
            .stores
            .iter()
            .filter(|s| s.product_id == product_id)
            .cloned()
            .collect()
    }

    /// Overwrite a slot directly, bypassing the version guard.
    pub fn put_store(&self, store: Store) {
        let mut tables = self.tables.lock().unwrap();
        match tables.stores.iter_mut().find(|s| s.id == store.id) {
            Some(existing) => *existing = store,
            None => tables.stores.push(store),
        }
    }

    fn with_quantity(tables: &Tables, mut product: Product, now: DateTime<Utc>) -> Product {
        let available = tables
            .stores
            .iter()
            .filter(|s| s.product_id == product.id && s.is_available(now))
            .count();
        product.quantity = u32::try_from(available).unwrap_or(u32::MAX);
        product
    }

    fn find_product(
        &self,
        what: &str,
        pred: impl Fn(&Product) -> bool,
    ) -> Result<Option<Product>, StorageError> {
        self.failure.check(what)?;
        let now = self.clock.now();
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .products
            .values()
            .find(|p| !p.deleted && pred(p))
            .cloned()
            .map(|p| Self::with_quantity(&tables, p, now)))
    }
}

impl ProductReader for InMemoryLedger {
    fn get_by_id(&self, id: ProductId) -> BoxFuture<'_, Result<Option<Product>, StorageError>> {
        let result = self.find_product("ledger get_by_id", |p| p.id == id);
        Box::pin(async move { result })
    }

    fn get_by_slug<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Result<Option<Product>, StorageError>> {
        let result = self.find_product("ledger get_by_slug", |p| p.slug == slug);
        Box::pin(async move { result })
    }

    fn list<'a>(&'a self, query: &'a ListQuery) -> BoxFuture<'a, Result<Vec<Product>, StorageError>> {
        let result = self.failure.check("ledger list").map(|()| {
            let now = self.clock.now();
            let tables = self.tables.lock().unwrap();
            let needle = query.name_filter().map(str::to_lowercase);
            let mut products: Vec<Product> = tables
                .products
                .values()
                .filter(|p| !p.deleted)
                .filter(|p| needle.as_ref().is_none_or(|n| p.name.to_lowercase().contains(n)))
                .cloned()
                .collect();
            products.sort_by(|a, b| a.name.cmp(&b.name));
            let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
            products
                .into_iter()
                .skip(offset)
                .take(query.size as usize)
                .map(|p| Self::with_quantity(&tables, p, now))
                .collect()
        });
        Box::pin(async move { result })
    }
}

impl ProductLedger for InMemoryLedger {
    fn insert_product<'a>(&'a self, product: &'a Product) -> BoxFuture<'a, Result<(), StorageError>> {
        let result = self.failure.check("ledger insert_product").and_then(|()| {
            let mut tables = self.tables.lock().unwrap();
            let clash = tables.products.values().any(|p| {
                p.id == product.id
                    || (!p.deleted && (p.name == product.name || p.slug == product.slug))
            });
            if clash {
                return Err(StorageError::Duplicate(format!("product {}", product.slug)));
            }
            tables.products.insert(product.id, product.clone());
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn update_product<'a>(&'a self, product: &'a Product) -> BoxFuture<'a, Result<(), StorageError>> {
        let result = self.failure.check("ledger update_product").and_then(|()| {
            let mut tables = self.tables.lock().unwrap();
            let clash = tables.products.values().any(|p| {
                p.id != product.id && !p.deleted && (p.name == product.name || p.slug == product.slug)
            });
            if clash {
                return Err(StorageError::Duplicate(format!("product {}", product.slug)));
            }
            match tables.products.get_mut(&product.id) {
                Some(stored) if product.version > 0 && stored.version == product.version - 1 => {
                    *stored = Product {
                        created_at: stored.created_at,
                        deleted: stored.deleted,
                        ..product.clone()
                    };
                    Ok(())
                }
                _ => Err(StorageError::VersionConflict {
                    entity: "product",
                    id: product.id.to_string(),
                }),
            }
        });
        Box::pin(async move { result })
    }

    fn find_product_by_name<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Product>, StorageError>> {
        let result = self.find_product("ledger find_product_by_name", |p| p.name == name);
        Box::pin(async move { result })
    }
}

impl StoreLedger for InMemoryLedger {
    fn insert_stores<'a>(&'a self, stores: &'a [Store]) -> BoxFuture<'a, Result<(), StorageError>> {
        let result = self.failure.check("ledger insert_stores").and_then(|()| {
            let mut tables = self.tables.lock().unwrap();
            if let Some(dup) = stores
                .iter()
                .find(|new| tables.stores.iter().any(|s| s.id == new.id))
            {
                return Err(StorageError::Duplicate(format!("store {}", dup.id)));
            }
            tables.stores.extend_from_slice(stores);
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn find_store(&self, id: StoreId) -> BoxFuture<'_, Result<Option<Store>, StorageError>> {
        let result = self.failure.check("ledger find_store").map(|()| {
            self.tables
                .lock()
                .unwrap()
                .stores
                .iter()
                .find(|s| s.id == id && !s.deleted)
                .cloned()
        });
        Box::pin(async move { result })
    }

    fn available_stores(
        &self,
        product_id: ProductId,
        limit: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Store>, StorageError>> {
        let result = self.failure.check("ledger available_stores").map(|()| {
            let tables = self.tables.lock().unwrap();
            let mut stores: Vec<Store> = tables
                .stores
                .iter()
                .filter(|s| s.product_id == product_id && s.is_available(now))
                .cloned()
                .collect();
            stores.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            stores.truncate(limit as usize);
            stores
        });
        Box::pin(async move { result })
    }

    fn update_stores<'a>(&'a self, stores: &'a [Store]) -> BoxFuture<'a, Result<(), StorageError>> {
        let result = self.failure.check("ledger update_stores").and_then(|()| {
            let mut tables = self.tables.lock().unwrap();
            let stale = stores.iter().find(|new| {
                !tables
                    .stores
                    .iter()
                    .any(|s| s.id == new.id && !s.deleted && new.version > 0 && s.version == new.version - 1)
            });
            if let Some(stale) = stale {
                return Err(StorageError::VersionConflict {
                    entity: "store",
                    id: stale.id.to_string(),
                });
            }
            for new in stores {
                if let Some(existing) = tables.stores.iter_mut().find(|s| s.id == new.id) {
                    existing.booked_at = new.booked_at;
                    existing.sold = new.sold;
                    existing.updated_at = new.updated_at;
                    existing.version = new.version;
                }
            }
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn booked_stores(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<Vec<Store>, StorageError>> {
        let result = self.failure.check("ledger booked_stores").map(|()| {
            self.tables
                .lock()
                .unwrap()
                .stores
                .iter()
                .filter(|s| !s.sold && !s.deleted && s.booked_at.is_some_and(|at| at >= now))
                .cloned()
                .collect()
        });
        Box::pin(async move { result })
    }
}
