//! Bus message handlers.
//!
//! Two consumers drive the service from the bus:
//!
//! - [`LedgerCommandHandler`] applies slot commands (`*-ledger` topics) to the
//!   reservation engine.
//! - [`ReplicaHandler`] copies committed snapshots (`*-replica` topics) into
//!   the replica and keeps the fast cache in step.
//!
//! Handlers see raw payload bytes so the consumer loop stays message-agnostic.

use crate::reservation::ReservationEngine;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use stockroom_core::cache::FastCache;
use stockroom_core::error::CatalogError;
use stockroom_core::message::CatalogMessage;
use stockroom_core::model::{Product, ProductId, Store};
use stockroom_core::replica::ReplicaStore;

/// Processes one payload received from the bus.
///
/// The consumer acknowledges a payload once `handle` returns. Infrastructure
/// failures and version conflicts leave it unacknowledged for redelivery;
/// any other error is logged and the payload is acknowledged.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an encoded [`CatalogMessage`].
    ///
    /// # Errors
    ///
    /// Returns the decoding or processing error.
    async fn handle(&self, data: &[u8]) -> Result<(), CatalogError>;
}

/// Applies slot commands to the ledger.
pub struct LedgerCommandHandler {
    engine: Arc<ReservationEngine>,
}

impl LedgerCommandHandler {
    /// Wrap the engine.
    #[must_use]
    pub const fn new(engine: Arc<ReservationEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl EventHandler for LedgerCommandHandler {
    async fn handle(&self, data: &[u8]) -> Result<(), CatalogError> {
        let message = CatalogMessage::decode(data)?;
        let result = match message {
            CatalogMessage::CreateStores(cmd) => self.engine.create_stores(cmd).await.map(drop),
            CatalogMessage::BookStores(cmd) => {
                let order_id = cmd.order_id;
                if let Err(e) = self.engine.book(cmd).await {
                    // The order was already canceled on the order-status topic.
                    tracing::info!(order_id = %order_id, reason = %e, "Booking rejected");
                }
                return Ok(());
            }
            CatalogMessage::UnbookStore(cmd) => self.engine.unbook(cmd).await.map(drop),
            CatalogMessage::PayStores(cmd) => self.engine.pay(cmd).await.map(drop),
            other => {
                tracing::debug!(message = ?other, "Ignoring non-command message on a ledger topic");
                return Ok(());
            }
        };

        result
    }
}

/// Mirrors committed snapshots into the replica and the cache.
pub struct ReplicaHandler {
    replica: Arc<dyn ReplicaStore>,
    cache: Arc<dyn FastCache>,
}

impl ReplicaHandler {
    /// Build the handler.
    #[must_use]
    pub fn new(replica: Arc<dyn ReplicaStore>, cache: Arc<dyn FastCache>) -> Self {
        Self { replica, cache }
    }

    async fn apply_product(&self, product: &Product) -> Result<(), CatalogError> {
        self.replica.upsert_product(product).await?;
        self.refresh_cache(product.id).await;
        Ok(())
    }

    async fn apply_stores(&self, stores: &[Store]) -> Result<(), CatalogError> {
        if stores.is_empty() {
            return Ok(());
        }
        self.replica.upsert_stores(stores).await?;

        let mut seen = HashSet::new();
        for store in stores {
            if seen.insert(store.product_id) {
                self.refresh_cache(store.product_id).await;
            }
        }
        Ok(())
    }

    /// Re-read from the replica so the cached quantity is the derived one.
    async fn refresh_cache(&self, id: ProductId) {
        let product = match self.replica.get_by_id(id).await {
            Ok(Some(product)) => product,
            Ok(None) => {
                tracing::debug!(product_id = %id, "Product not in replica yet, cache untouched");
                return;
            }
            Err(e) => {
                tracing::warn!(product_id = %id, error = %e, "Replica read-back failed");
                return;
            }
        };

        if let Err(e) = self.cache.set(&product).await {
            tracing::warn!(product_id = %id, error = %e, "Cache update failed");
        }
    }
}

#[async_trait]
impl EventHandler for ReplicaHandler {
    async fn handle(&self, data: &[u8]) -> Result<(), CatalogError> {
        match CatalogMessage::decode(data)? {
            CatalogMessage::ProductCreated { product, .. }
            | CatalogMessage::ProductUpdated { product, .. } => self.apply_product(&product).await,
            CatalogMessage::StoresCreated { stores, .. }
            | CatalogMessage::StoresBooked { stores, .. }
            | CatalogMessage::StoresUnbooked { stores, .. }
            | CatalogMessage::StoresPaid { stores, .. } => self.apply_stores(&stores).await,
            other => {
                tracing::debug!(message = ?other, "Ignoring message on a replica topic");
                Ok(())
            }
        }
    }
}
