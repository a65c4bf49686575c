//! Caller-facing operations.
//!
//! `Catalog` is what an HTTP layer would hold. Every call runs under the
//! configured deadline; an expired deadline is an infrastructure error.
//!
//! Reads are dropped when the deadline fires. Mutations run in their own
//! task and always finish: a booking that outlives its caller still
//! compensates or publishes, and the watchdog still learns about its holds.

use crate::pipeline::ProductCommands;
use crate::read_repository::ProductRepository;
use crate::rebuild::CacheRebuildScheduler;
use crate::reservation::ReservationEngine;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use stockroom_core::command::{
    BookStores, CreateProduct, CreateStores, PayStores, UnbookStore, UpdateProduct,
};
use stockroom_core::error::CatalogError;
use stockroom_core::model::{Product, ProductId, Store};
use stockroom_core::reader::ListQuery;

/// Product and slot operations with deadlines.
#[derive(Clone)]
pub struct Catalog {
    commands: Arc<ProductCommands>,
    reservations: Arc<ReservationEngine>,
    reads: Arc<ProductRepository>,
    scheduler: CacheRebuildScheduler,
    timeout: Duration,
}

impl Catalog {
    /// Assemble the facade.
    #[must_use]
    pub const fn new(
        commands: Arc<ProductCommands>,
        reservations: Arc<ReservationEngine>,
        reads: Arc<ProductRepository>,
        scheduler: CacheRebuildScheduler,
        timeout: Duration,
    ) -> Self {
        Self {
            commands,
            reservations,
            reads,
            scheduler,
            timeout,
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, CatalogError>>,
    ) -> Result<T, CatalogError> {
        if let Ok(result) = tokio::time::timeout(self.timeout, fut).await {
            result
        } else {
            tracing::warn!(operation, timeout = ?self.timeout, "Operation timed out");
            metrics::counter!("catalog.timeouts", "operation" => operation).increment(1);
            Err(CatalogError::Infrastructure(format!(
                "{operation} timed out after {:?}",
                self.timeout
            )))
        }
    }

    /// Run `task` on its own and wait for it under the deadline.
    ///
    /// The task keeps running after the deadline fires.
    async fn detached<T, F>(&self, operation: &'static str, task: F) -> Result<T, CatalogError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, CatalogError>> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.bounded(operation, async move {
            handle.await.map_err(|e| {
                tracing::error!(operation, error = %e, "Operation task failed");
                CatalogError::Infrastructure(format!("{operation} did not complete: {e}"))
            })?
        })
        .await
    }

    /// Register a product.
    ///
    /// # Errors
    ///
    /// See [`ProductCommands::create`].
    pub async fn create_product(&self, cmd: CreateProduct) -> Result<Product, CatalogError> {
        let commands = Arc::clone(&self.commands);
        self.detached("create_product", async move { commands.create(cmd).await })
            .await
    }

    /// Update a product.
    ///
    /// # Errors
    ///
    /// See [`ProductCommands::update`].
    pub async fn update_product(&self, cmd: UpdateProduct) -> Result<Product, CatalogError> {
        let commands = Arc::clone(&self.commands);
        self.detached("update_product", async move { commands.update(cmd).await })
            .await
    }

    /// Product by id.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] if no tier knows the product.
    pub async fn get_product(&self, id: ProductId) -> Result<Product, CatalogError> {
        self.bounded("get_product", self.reads.get_by_id(id))
            .await?
            .ok_or_else(|| CatalogError::not_found(format!("product id: {id} not found")))
    }

    /// Product by slug.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] if no tier knows the slug.
    pub async fn get_product_by_slug(&self, slug: &str) -> Result<Product, CatalogError> {
        self.bounded("get_product_by_slug", self.reads.get_by_slug(slug))
            .await?
            .ok_or_else(|| CatalogError::not_found(format!("product slug: {slug} not found")))
    }

    /// One page of products.
    ///
    /// # Errors
    ///
    /// [`CatalogError::Infrastructure`] if every tier failed.
    pub async fn list_products(&self, query: &ListQuery) -> Result<Vec<Product>, CatalogError> {
        self.bounded("list_products", self.reads.list(query)).await
    }

    /// Allocate slots.
    ///
    /// # Errors
    ///
    /// See [`ReservationEngine::create_stores`].
    pub async fn create_stores(&self, cmd: CreateStores) -> Result<Vec<Store>, CatalogError> {
        let engine = Arc::clone(&self.reservations);
        self.detached("create_stores", async move { engine.create_stores(cmd).await })
            .await
    }

    /// Hold slots for an order.
    ///
    /// # Errors
    ///
    /// See [`ReservationEngine::book`].
    pub async fn book_stores(&self, cmd: BookStores) -> Result<Vec<Store>, CatalogError> {
        let engine = Arc::clone(&self.reservations);
        self.detached("book_stores", async move { engine.book(cmd).await })
            .await
    }

    /// Release one slot.
    ///
    /// # Errors
    ///
    /// See [`ReservationEngine::unbook`].
    pub async fn unbook_store(&self, cmd: UnbookStore) -> Result<Option<Store>, CatalogError> {
        let engine = Arc::clone(&self.reservations);
        self.detached("unbook_store", async move { engine.unbook(cmd).await })
            .await
    }

    /// Sell slots.
    ///
    /// # Errors
    ///
    /// See [`ReservationEngine::pay`].
    pub async fn pay_stores(&self, cmd: PayStores) -> Result<Vec<Store>, CatalogError> {
        let engine = Arc::clone(&self.reservations);
        self.detached("pay_stores", async move { engine.pay(cmd).await })
            .await
    }

    /// Start a full cache rebuild from the replica and return at once.
    ///
    /// A rebuild already in progress absorbs the request. The handle only
    /// reports when the background run has finished; its outcome is logged.
    #[must_use]
    pub fn refresh_cache(&self) -> tokio::task::JoinHandle<()> {
        tracing::info!("Manual cache refresh requested");
        self.scheduler.trigger()
    }
}
