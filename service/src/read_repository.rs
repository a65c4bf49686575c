//! Cascading product reads.
//!
//! Tiers are tried in order and the first hit wins:
//!
//! | read          | tiers                      | repair on hit                         |
//! |---------------|----------------------------|---------------------------------------|
//! | by id / slug  | replica → ledger           | replica hit: warm cache               |
//! |               |                            | ledger hit: re-publish create + cache |
//! | listing       | cache → replica → ledger   | none                                  |
//!
//! A failing tier is logged and skipped. Only when every tier fails does the
//! caller see an error.

use crate::outbox::Outbox;
use std::sync::Arc;
use stockroom_core::cache::FastCache;
use stockroom_core::environment::Clock;
use stockroom_core::error::{CatalogError, StorageError};
use stockroom_core::event_bus::topics;
use stockroom_core::ledger::ProductLedger;
use stockroom_core::message::{CatalogMessage, EventMeta};
use stockroom_core::model::{MessageType, Product, ProductId};
use stockroom_core::reader::ListQuery;
use stockroom_core::replica::ReplicaStore;
use stockroom_core::BoxFuture;

/// One read provider. Every variant answers the same `ProductReader` calls;
/// the variant only decides how a hit is repaired.
#[derive(Clone)]
enum Tier {
    Cache(Arc<dyn FastCache>),
    Replica(Arc<dyn ReplicaStore>),
    Ledger(Arc<dyn ProductLedger>),
}

impl Tier {
    const fn name(&self) -> &'static str {
        match self {
            Self::Cache(_) => "cache",
            Self::Replica(_) => "replica",
            Self::Ledger(_) => "ledger",
        }
    }

    fn get<'a>(&'a self, key: Key<'a>) -> BoxFuture<'a, Result<Option<Product>, StorageError>> {
        match (self, key) {
            (Self::Cache(c), Key::Id(id)) => c.get_by_id(id),
            (Self::Cache(c), Key::Slug(slug)) => c.get_by_slug(slug),
            (Self::Replica(r), Key::Id(id)) => r.get_by_id(id),
            (Self::Replica(r), Key::Slug(slug)) => r.get_by_slug(slug),
            (Self::Ledger(l), Key::Id(id)) => l.get_by_id(id),
            (Self::Ledger(l), Key::Slug(slug)) => l.get_by_slug(slug),
        }
    }

    fn list<'a>(&'a self, query: &'a ListQuery) -> BoxFuture<'a, Result<Vec<Product>, StorageError>> {
        match self {
            Self::Cache(c) => c.list(query),
            Self::Replica(r) => r.list(query),
            Self::Ledger(l) => l.list(query),
        }
    }
}

#[derive(Clone, Copy)]
enum Key<'a> {
    Id(ProductId),
    Slug(&'a str),
}

/// Read path over cache, replica and ledger.
pub struct ProductRepository {
    point: Vec<Tier>,
    listing: Vec<Tier>,
    outbox: Outbox,
    clock: Arc<dyn Clock>,
}

impl ProductRepository {
    /// Build the cascade.
    #[must_use]
    pub fn new(
        cache: Arc<dyn FastCache>,
        replica: Arc<dyn ReplicaStore>,
        ledger: Arc<dyn ProductLedger>,
        outbox: Outbox,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let replica = Tier::Replica(replica);
        let ledger = Tier::Ledger(ledger);
        Self {
            point: vec![replica.clone(), ledger.clone()],
            listing: vec![Tier::Cache(cache), replica, ledger],
            outbox,
            clock,
        }
    }

    /// Product by id.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Infrastructure`] if every tier failed.
    pub async fn get_by_id(&self, id: ProductId) -> Result<Option<Product>, CatalogError> {
        self.lookup(Key::Id(id)).await
    }

    /// Product by slug.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Infrastructure`] if every tier failed.
    pub async fn get_by_slug(&self, slug: &str) -> Result<Option<Product>, CatalogError> {
        self.lookup(Key::Slug(slug)).await
    }

    /// One page of products ordered by name.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Infrastructure`] if every tier failed.
    pub async fn list(&self, query: &ListQuery) -> Result<Vec<Product>, CatalogError> {
        let mut failures = 0;
        for tier in &self.listing {
            match tier.list(query).await {
                Ok(products) if !products.is_empty() => {
                    tracing::debug!(tier = tier.name(), count = products.len(), "Listing served");
                    return Ok(products);
                }
                Ok(_) => {}
                Err(e) => {
                    failures += 1;
                    tracing::warn!(tier = tier.name(), error = %e, "Listing tier failed");
                }
            }
        }

        if failures == self.listing.len() {
            return Err(CatalogError::Infrastructure("every product tier failed".to_string()));
        }
        Ok(Vec::new())
    }

    async fn lookup(&self, key: Key<'_>) -> Result<Option<Product>, CatalogError> {
        let mut failures = 0;
        for tier in &self.point {
            match tier.get(key).await {
                Ok(Some(product)) => {
                    self.repair(tier, &product);
                    return Ok(Some(product));
                }
                Ok(None) => {}
                Err(e) => {
                    failures += 1;
                    tracing::warn!(tier = tier.name(), error = %e, "Product tier failed");
                }
            }
        }

        if failures == self.point.len() {
            return Err(CatalogError::Infrastructure("every product tier failed".to_string()));
        }
        Ok(None)
    }

    fn repair(&self, hit: &Tier, product: &Product) {
        match hit {
            Tier::Cache(_) => {}
            Tier::Replica(_) => {
                tracing::debug!(product_id = %product.id, "Warming cache from replica");
                self.outbox.cache(product.clone());
            }
            Tier::Ledger(_) => {
                tracing::info!(product_id = %product.id, "Product missing from replica, repairing");
                metrics::counter!("repository.ledger_repairs").increment(1);
                self.outbox.publish(
                    topics::PRODUCT_CREATE_REPLICA,
                    CatalogMessage::ProductCreated {
                        meta: EventMeta {
                            aggregate_id: *product.id.as_uuid(),
                            message_type: MessageType::ProductCreate,
                            timestamp: self.clock.now(),
                        },
                        product: product.clone(),
                    },
                );
                self.outbox.cache(product.clone());
            }
        }
    }
}
