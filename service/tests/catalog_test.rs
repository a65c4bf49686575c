//! Product commands and reads through the `Catalog` facade.
//!
//! Run with: `cargo test -p stockroom --test catalog_test`

#![allow(clippy::unwrap_used)]

mod common;

use common::{Harness, create_product};
use std::sync::Arc;
use std::time::Duration;
use stockroom::rebuild::RebuildOutcome;
use stockroom::{Collaborators, Config, Stockroom};
use stockroom_core::BoxFuture;
use stockroom_core::cache::FastCache;
use stockroom_core::command::{BookLine, BookStores, UpdateProduct};
use stockroom_core::error::{CatalogError, ConflictKind, StorageError};
use stockroom_core::event_bus::topics;
use stockroom_core::message::CatalogMessage;
use stockroom_core::ledger::StoreLedger;
use stockroom_core::model::{MessageType, OrderId, Product, ProductId, Store, StoreId};
use stockroom_core::reader::{ListQuery, ProductReader};
use stockroom_core::replica::ReplicaStore;
use stockroom_core::validation::RuleValidator;
use stockroom_testing::mocks::{epoch, test_clock};
use stockroom_testing::{
    InMemoryCache, InMemoryEventBus, InMemoryEventLog, InMemoryLedger, InMemoryReplica,
    RecordingNotifier,
};
use tokio::sync::broadcast;

#[tokio::test]
async fn created_product_reaches_every_tier() {
    let mut h = Harness::new();
    let product = h.product_with("Desk Lamp", 3).await;

    assert_eq!(product.version, 0);
    assert_eq!(h.ledger.stores_of(product.id).len(), 3);

    // Replica handler re-reads the replica, so the cache carries the slot count.
    let cached = h.cache.get_by_id(product.id).await.unwrap().unwrap();
    assert_eq!(cached.quantity, 3);
    assert_eq!(h.replica.product_count(), 1);

    let kinds: Vec<MessageType> = h.log.records().iter().map(|r| r.message_type).collect();
    assert!(kinds.contains(&MessageType::ProductCreate));
    assert!(kinds.contains(&MessageType::StoreCreate));

    let fetched = h.catalog.get_product(product.id).await.unwrap();
    assert_eq!(fetched.quantity, 3);
}

#[tokio::test]
async fn update_propagates_to_the_replica() {
    let mut h = Harness::new();
    let product = h.product_with("Desk Lamp", 1).await;

    let updated = h
        .catalog
        .update_product(UpdateProduct {
            id: product.id,
            name: "Desk Lamp XL".to_string(),
            slug: "desk-lamp-xl".to_string(),
            description: product.description.clone(),
            price: 59.0,
            image: product.image.clone(),
            version: product.version,
        })
        .await
        .unwrap();
    h.pump().await;

    assert_eq!(updated.version, 1);
    let fetched = h.catalog.get_product_by_slug("desk-lamp-xl").await.unwrap();
    assert_eq!(fetched.name, "Desk Lamp XL");
    assert_eq!(fetched.version, 1);
    assert!(h.catalog.get_product_by_slug("desk-lamp").await.is_err());
}

#[tokio::test]
async fn duplicate_names_are_conflicts() {
    let mut h = Harness::new();
    h.product_with("Desk Lamp", 1).await;

    let err = h
        .catalog
        .create_product(create_product("Desk Lamp", 1))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CatalogError::Conflict {
            kind: ConflictKind::Uniqueness,
            ..
        }
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn invalid_product_is_rejected_without_side_effects() {
    let h = Harness::new();
    let mut cmd = create_product("Lamp", 1);
    cmd.price = 0.0;
    cmd.slug = String::new();

    let err = h.catalog.create_product(cmd).await.unwrap_err();
    h.outbox.settle().await;

    let CatalogError::Validation(violations) = err else {
        unreachable!("expected a validation error");
    };
    assert_eq!(violations.len(), 2);
    assert!(h.bus.published().is_empty());
    assert!(h.log.records().is_empty());
}

#[tokio::test]
async fn missing_product_is_not_found() {
    let h = Harness::new();
    let err = h.catalog.get_product(ProductId::new()).await.unwrap_err();
    assert!(matches!(err, CatalogError::NotFound(_)));
}

#[tokio::test]
async fn replica_hit_makes_the_next_cache_lookup_succeed() {
    let h = Harness::new();
    let product = sample("Armchair");
    h.replica.upsert_product(&product).await.unwrap();
    assert!(!h.cache.contains(product.id));

    h.catalog.get_product(product.id).await.unwrap();
    h.outbox.settle().await;

    let cached = h.cache.get_by_id(product.id).await.unwrap();
    assert_eq!(cached.map(|p| p.id), Some(product.id));
}

#[tokio::test]
async fn ledger_hit_repairs_replica_and_cache() {
    let mut h = Harness::new();
    let product = sample("Ottoman");
    stockroom_core::ledger::ProductLedger::insert_product(h.ledger.as_ref(), &product)
        .await
        .unwrap();

    h.catalog.get_product(product.id).await.unwrap();
    h.pump().await;

    assert!(h.cache.contains(product.id));
    assert!(h.replica.get_by_id(product.id).await.unwrap().is_some());
    assert!(matches!(
        h.messages_on(topics::PRODUCT_CREATE_REPLICA).as_slice(),
        [CatalogMessage::ProductCreated { product: p, .. }] if p.id == product.id
    ));
}

#[tokio::test]
async fn listing_pages_through_products_by_name() {
    let mut h = Harness::new();
    for name in ["Walnut Desk", "Oak Desk", "Pine Shelf", "Birch Desk"] {
        h.product_with(name, 1).await;
    }

    let first = h.catalog.list_products(&ListQuery::new("desk", 1, 2)).await.unwrap();
    let second = h.catalog.list_products(&ListQuery::new("DESK", 2, 2)).await.unwrap();

    let names = |page: &[Product]| page.iter().map(|p| p.name.clone()).collect::<Vec<_>>();
    assert_eq!(names(&first), vec!["Birch Desk", "Oak Desk"]);
    assert_eq!(names(&second), vec!["Walnut Desk"]);
}

#[tokio::test]
async fn rebuild_restores_a_wiped_cache() {
    let mut h = Harness::new();
    h.product_with("Lamp", 1).await;
    h.product_with("Desk", 1).await;
    FastCache::refresh(h.cache.as_ref(), &[]).await.unwrap();
    assert!(h.cache.is_empty());

    assert_eq!(h.scheduler.rebuild_once().await.unwrap(), RebuildOutcome::Rebuilt(2));
    assert_eq!(h.cache.len(), 2);
}

#[tokio::test]
async fn manual_refresh_rebuilds_the_cache_in_the_background() {
    let mut h = Harness::new();
    h.product_with("Lamp", 1).await;
    h.product_with("Desk", 1).await;
    FastCache::refresh(h.cache.as_ref(), &[]).await.unwrap();

    let refresh = h.catalog.refresh_cache();
    // Nothing has run yet: the call only queued the rebuild.
    assert!(h.cache.is_empty());

    refresh.await.unwrap();
    assert_eq!(h.cache.len(), 2);
    assert_eq!(h.cache.refresh_count(), 2);
}

#[tokio::test]
async fn failed_side_effects_are_reported_not_raised() {
    let mut h = Harness::new();
    h.log.set_failing(true);

    let product = h.product_with("Lamp", 1).await;

    assert_eq!(h.catalog.get_product(product.id).await.unwrap().id, product.id);
    let stats = h.outbox.stats();
    assert!(stats.failed >= 1);
    assert!(!h.notifier.messages().is_empty());
}

/// Replica whose point reads never finish in time.
struct SlowReplica(InMemoryReplica);

impl ProductReader for SlowReplica {
    fn get_by_id(&self, id: ProductId) -> BoxFuture<'_, Result<Option<Product>, StorageError>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            self.0.get_by_id(id).await
        })
    }

    fn get_by_slug<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Result<Option<Product>, StorageError>> {
        self.0.get_by_slug(slug)
    }

    fn list<'a>(&'a self, query: &'a ListQuery) -> BoxFuture<'a, Result<Vec<Product>, StorageError>> {
        self.0.list(query)
    }
}

impl ReplicaStore for SlowReplica {
    fn upsert_product<'a>(&'a self, product: &'a Product) -> BoxFuture<'a, Result<(), StorageError>> {
        self.0.upsert_product(product)
    }

    fn upsert_stores<'a>(&'a self, stores: &'a [Store]) -> BoxFuture<'a, Result<(), StorageError>> {
        self.0.upsert_stores(stores)
    }

    fn all_products(&self) -> BoxFuture<'_, Result<Vec<Product>, StorageError>> {
        self.0.all_products()
    }
}

/// Slot ledger whose batch updates take far longer than any deadline.
struct SlowStoreLedger(Arc<InMemoryLedger>);

impl StoreLedger for SlowStoreLedger {
    fn insert_stores<'a>(&'a self, stores: &'a [Store]) -> BoxFuture<'a, Result<(), StorageError>> {
        self.0.insert_stores(stores)
    }

    fn find_store(&self, id: StoreId) -> BoxFuture<'_, Result<Option<Store>, StorageError>> {
        self.0.find_store(id)
    }

    fn available_stores(
        &self,
        product_id: ProductId,
        limit: u32,
        now: chrono::DateTime<chrono::Utc>,
    ) -> BoxFuture<'_, Result<Vec<Store>, StorageError>> {
        self.0.available_stores(product_id, limit, now)
    }

    fn update_stores<'a>(&'a self, stores: &'a [Store]) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.0.update_stores(stores).await
        })
    }

    fn booked_stores(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> BoxFuture<'_, Result<Vec<Store>, StorageError>> {
        self.0.booked_stores(now)
    }
}

fn collaborators(replica: Arc<dyn ReplicaStore>) -> Collaborators {
    let ledger = Arc::new(InMemoryLedger::new());
    Collaborators {
        product_ledger: ledger.clone(),
        store_ledger: ledger,
        event_log: Arc::new(InMemoryEventLog::new()),
        replica,
        cache: Arc::new(InMemoryCache::new()),
        bus: Arc::new(InMemoryEventBus::new()),
        notifier: Arc::new(RecordingNotifier::new()),
        validator: Arc::new(RuleValidator),
        clock: Arc::new(test_clock()),
    }
}

#[tokio::test(start_paused = true)]
async fn slow_tier_hits_the_deadline() {
    let config = Config::from_lookup(|key| (key == "OPERATION_TIMEOUT_MS").then(|| "250".to_string()));
    let stockroom = Stockroom::assemble(
        collaborators(Arc::new(SlowReplica(InMemoryReplica::new()))),
        &config,
    );

    let err = stockroom.catalog.get_product(ProductId::new()).await.unwrap_err();

    let CatalogError::Infrastructure(message) = err else {
        unreachable!("expected an infrastructure error");
    };
    assert!(message.contains("get_product timed out"));
}

#[tokio::test(start_paused = true)]
async fn booking_past_its_deadline_still_completes() {
    let config = Config::from_lookup(|key| (key == "OPERATION_TIMEOUT_MS").then(|| "250".to_string()));
    let ledger = Arc::new(InMemoryLedger::with_clock(Arc::new(test_clock())));
    let bus = Arc::new(InMemoryEventBus::new());
    let mut collab = collaborators(Arc::new(InMemoryReplica::new()));
    collab.product_ledger = ledger.clone();
    collab.store_ledger = Arc::new(SlowStoreLedger(ledger.clone()));
    collab.bus = bus.clone();
    let Stockroom {
        catalog,
        outbox,
        outbox_worker,
        mut watchdog,
        ..
    } = Stockroom::assemble(collab, &config);
    let (_shutdown, rx) = broadcast::channel(1);
    let _worker = outbox_worker.spawn(rx);

    let product_id = ProductId::new();
    let slot = Store::new(product_id, epoch());
    ledger.put_store(slot.clone());

    let err = catalog
        .book_stores(BookStores {
            order_id: OrderId::new(),
            products: vec![BookLine {
                product_id,
                quantity: 1,
            }],
        })
        .await
        .unwrap_err();
    let CatalogError::Infrastructure(message) = err else {
        unreachable!("expected an infrastructure error");
    };
    assert!(message.contains("book_stores timed out"));

    // The booking carries on without its caller.
    tokio::time::sleep(Duration::from_secs(60)).await;
    outbox.settle().await;

    let held = ledger.store(slot.id).unwrap();
    assert_eq!(held.version, 1);
    assert!(held.booked_at.is_some());
    assert!(matches!(
        bus.messages_on(topics::STORE_BOOK_REPLICA).as_slice(),
        [CatalogMessage::StoresBooked { stores, .. }] if stores[0].id == slot.id
    ));
    assert_eq!(bus.messages_on(topics::ORDER_STORE_BOOKED).len(), 1);
    assert!(bus.messages_on(topics::ORDER_STATUS).is_empty());
    watchdog.drain_commands();
    assert!(watchdog.is_watching(slot.id));
}

#[tokio::test]
async fn started_service_serves_and_shuts_down() {
    let bus = Arc::new(InMemoryEventBus::new());
    let mut collab = collaborators(Arc::new(InMemoryReplica::new()));
    collab.bus = bus.clone();
    let (catalog, app) = Stockroom::assemble(collab, &common::config()).start();
    assert_eq!(app.task_count(), 5);

    // Let the consumers subscribe before anything is published.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let product = catalog.create_product(create_product("Lamp", 2)).await.unwrap();

    // The ledger consumer provisions the slots asynchronously.
    let mut provisioned = false;
    for _ in 0..100 {
        if !bus.messages_on(topics::STORE_CREATE_REPLICA).is_empty() {
            provisioned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(provisioned);

    tokio::time::timeout(Duration::from_secs(15), app.shutdown())
        .await
        .unwrap();
    assert_eq!(catalog.get_product(product.id).await.unwrap().id, product.id);
}

fn sample(name: &str) -> Product {
    Product {
        id: ProductId::new(),
        name: name.to_string(),
        slug: name.to_lowercase(),
        description: String::new(),
        price: 30.0,
        quantity: 0,
        image: String::new(),
        created_at: epoch(),
        updated_at: None,
        version: 0,
        deleted: false,
    }
}
