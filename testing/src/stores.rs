//! In-memory replica, cache, event log and notifier.

use crate::FailureSwitch;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use stockroom_core::BoxFuture;
use stockroom_core::cache::FastCache;
use stockroom_core::environment::{Clock, SystemClock};
use stockroom_core::error::StorageError;
use stockroom_core::event_log::EventLog;
use stockroom_core::model::{EventRecord, Product, ProductId, Store, StoreId};
use stockroom_core::notifier::{Notifier, NotifyError};
use stockroom_core::reader::{ListQuery, ProductReader};
use stockroom_core::replica::ReplicaStore;

fn page(mut products: Vec<Product>, query: &ListQuery) -> Vec<Product> {
    let needle = query.name_filter().map(str::to_lowercase);
    products.retain(|p| !p.deleted && needle.as_ref().is_none_or(|n| p.name.to_lowercase().contains(n)));
    products.sort_by(|a, b| a.name.cmp(&b.name));
    let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
    products.into_iter().skip(offset).take(query.size as usize).collect()
}

/// Replica store keeping products and slots in maps.
pub struct InMemoryReplica {
    products: Mutex<HashMap<ProductId, Product>>,
    stores: Mutex<HashMap<StoreId, Store>>,
    clock: Arc<dyn Clock>,
    failure: FailureSwitch,
}

impl Default for InMemoryReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryReplica {
    /// Empty replica deriving quantities against the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty replica that derives quantities against `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            products: Mutex::new(HashMap::new()),
            stores: Mutex::new(HashMap::new()),
            clock,
            failure: FailureSwitch::default(),
        }
    }

    /// Make every call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failure.set(failing);
    }

    /// Raw stored slot.
    #[must_use]
    pub fn store(&self, id: StoreId) -> Option<Store> {
        self.stores.lock().unwrap().get(&id).cloned()
    }

    /// Number of stored products.
    #[must_use]
    pub fn product_count(&self) -> usize {
        self.products.lock().unwrap().len()
    }

    fn with_quantity(&self, mut product: Product) -> Product {
        let now = self.clock.now();
        let available = self
            .stores
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.product_id == product.id && s.is_available(now))
            .count();
        product.quantity = u32::try_from(available).unwrap_or(u32::MAX);
        product
    }

    fn find(&self, what: &str, pred: impl Fn(&Product) -> bool) -> Result<Option<Product>, StorageError> {
        self.failure.check(what)?;
        let found = self
            .products
            .lock()
            .unwrap()
            .values()
            .find(|p| !p.deleted && pred(p))
            .cloned();
        Ok(found.map(|p| self.with_quantity(p)))
    }
}

impl ProductReader for InMemoryReplica {
    fn get_by_id(&self, id: ProductId) -> BoxFuture<'_, Result<Option<Product>, StorageError>> {
        let result = self.find("replica get_by_id", |p| p.id == id);
        Box::pin(async move { result })
    }

    fn get_by_slug<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Result<Option<Product>, StorageError>> {
        let result = self.find("replica get_by_slug", |p| p.slug == slug);
        Box::pin(async move { result })
    }

    fn list<'a>(&'a self, query: &'a ListQuery) -> BoxFuture<'a, Result<Vec<Product>, StorageError>> {
        let result = self.failure.check("replica list").map(|()| {
            let all: Vec<Product> = self.products.lock().unwrap().values().cloned().collect();
            page(all, query).into_iter().map(|p| self.with_quantity(p)).collect()
        });
        Box::pin(async move { result })
    }
}

impl ReplicaStore for InMemoryReplica {
    fn upsert_product<'a>(&'a self, product: &'a Product) -> BoxFuture<'a, Result<(), StorageError>> {
        let result = self.failure.check("replica upsert_product").map(|()| {
            self.products.lock().unwrap().insert(product.id, product.clone());
        });
        Box::pin(async move { result })
    }

    fn upsert_stores<'a>(&'a self, stores: &'a [Store]) -> BoxFuture<'a, Result<(), StorageError>> {
        let result = self.failure.check("replica upsert_stores").map(|()| {
            let mut map = self.stores.lock().unwrap();
            for store in stores {
                map.insert(store.id, store.clone());
            }
        });
        Box::pin(async move { result })
    }

    fn all_products(&self) -> BoxFuture<'_, Result<Vec<Product>, StorageError>> {
        let result = self.failure.check("replica all_products").map(|()| {
            let all: Vec<Product> = self
                .products
                .lock()
                .unwrap()
                .values()
                .filter(|p| !p.deleted)
                .cloned()
                .collect();
            all.into_iter().map(|p| self.with_quantity(p)).collect()
        });
        Box::pin(async move { result })
    }
}

/// Fast cache keeping products in a map.
#[derive(Default)]
pub struct InMemoryCache {
    products: Mutex<HashMap<ProductId, Product>>,
    refreshes: Mutex<u32>,
    failure: FailureSwitch,
}

impl InMemoryCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failure.set(failing);
    }

    /// Whether `id` is cached.
    #[must_use]
    pub fn contains(&self, id: ProductId) -> bool {
        self.products.lock().unwrap().contains_key(&id)
    }

    /// Number of cached products.
    #[must_use]
    pub fn len(&self) -> usize {
        self.products.lock().unwrap().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of completed full refreshes.
    #[must_use]
    pub fn refresh_count(&self) -> u32 {
        *self.refreshes.lock().unwrap()
    }

    fn find(&self, what: &str, pred: impl Fn(&Product) -> bool) -> Result<Option<Product>, StorageError> {
        self.failure.check(what)?;
        Ok(self.products.lock().unwrap().values().find(|p| pred(p)).cloned())
    }
}

impl ProductReader for InMemoryCache {
    fn get_by_id(&self, id: ProductId) -> BoxFuture<'_, Result<Option<Product>, StorageError>> {
        let result = self.find("cache get_by_id", |p| p.id == id);
        Box::pin(async move { result })
    }

    fn get_by_slug<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Result<Option<Product>, StorageError>> {
        let result = self.find("cache get_by_slug", |p| p.slug == slug);
        Box::pin(async move { result })
    }

    fn list<'a>(&'a self, query: &'a ListQuery) -> BoxFuture<'a, Result<Vec<Product>, StorageError>> {
        let result = self.failure.check("cache list").map(|()| {
            let all: Vec<Product> = self.products.lock().unwrap().values().cloned().collect();
            page(all, query)
        });
        Box::pin(async move { result })
    }
}

impl FastCache for InMemoryCache {
    fn set<'a>(&'a self, product: &'a Product) -> BoxFuture<'a, Result<(), StorageError>> {
        let result = self.failure.check("cache set").map(|()| {
            self.products.lock().unwrap().insert(product.id, product.clone());
        });
        Box::pin(async move { result })
    }

    fn refresh<'a>(&'a self, products: &'a [Product]) -> BoxFuture<'a, Result<(), StorageError>> {
        let result = self.failure.check("cache refresh").map(|()| {
            let mut map = self.products.lock().unwrap();
            map.clear();
            map.extend(products.iter().map(|p| (p.id, p.clone())));
            *self.refreshes.lock().unwrap() += 1;
        });
        Box::pin(async move { result })
    }
}

/// Event log that keeps records in a vector.
#[derive(Default)]
pub struct InMemoryEventLog {
    records: Mutex<Vec<EventRecord>>,
    failure: FailureSwitch,
}

impl InMemoryEventLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every append fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failure.set(failing);
    }

    /// Every appended record.
    #[must_use]
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl EventLog for InMemoryEventLog {
    fn append<'a>(&'a self, records: &'a [EventRecord]) -> BoxFuture<'a, Result<(), StorageError>> {
        let result = self.failure.check("event log append").map(|()| {
            self.records.lock().unwrap().extend_from_slice(records);
        });
        Box::pin(async move { result })
    }
}

/// Notifier that records every message.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    /// Empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message sent so far.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<(), NotifyError>> {
        self.messages.lock().unwrap().push(message.to_string());
        Box::pin(async { Ok(()) })
    }
}
