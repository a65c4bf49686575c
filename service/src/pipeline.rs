//! Product command pipeline.
//!
//! validate → uniqueness check → ledger write → (event log, publish) via the
//! outbox. The caller gets an answer as soon as the ledger has committed;
//! nothing downstream runs unless it did.

use crate::outbox::Outbox;
use std::sync::Arc;
use stockroom_core::command::{CreateProduct, CreateStores, UpdateProduct};
use stockroom_core::environment::Clock;
use stockroom_core::error::{CatalogError, ConflictKind, StorageError};
use stockroom_core::event_bus::topics;
use stockroom_core::ledger::ProductLedger;
use stockroom_core::message::{CatalogMessage, EventMeta};
use stockroom_core::model::{MessageType, Product, ProductId};
use stockroom_core::validation::{Validator, ensure_valid};

const ALREADY_EXISTS: &str = "product already exists";
const NAME_TAKEN: &str = "product with this name already exists with another id";

/// Create and update products.
#[derive(Clone)]
pub struct ProductCommands {
    ledger: Arc<dyn ProductLedger>,
    validator: Arc<dyn Validator>,
    outbox: Outbox,
    clock: Arc<dyn Clock>,
}

impl ProductCommands {
    /// Build the pipeline.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn ProductLedger>,
        validator: Arc<dyn Validator>,
        outbox: Outbox,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            validator,
            outbox,
            clock,
        }
    }

    /// Register a product and request its slots.
    ///
    /// On commit, slot allocation is requested on the store-create-ledger
    /// topic and the snapshot goes to the replica.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::Validation`] for malformed fields
    /// - [`CatalogError::Conflict`] if the name or slug is taken
    /// - [`CatalogError::Infrastructure`] if the ledger is unavailable
    pub async fn create(&self, cmd: CreateProduct) -> Result<Product, CatalogError> {
        ensure_valid(self.validator.as_ref(), &cmd)?;

        if self.ledger.find_product_by_name(&cmd.name).await?.is_some() {
            return Err(CatalogError::conflict(ConflictKind::Uniqueness, ALREADY_EXISTS));
        }

        let now = self.clock.now();
        let product = Product {
            id: if cmd.id.is_nil() { ProductId::new() } else { cmd.id },
            name: cmd.name,
            slug: cmd.slug,
            description: cmd.description,
            price: cmd.price,
            quantity: cmd.quantity,
            image: cmd.image,
            created_at: now,
            updated_at: None,
            version: 0,
            deleted: false,
        };

        self.ledger
            .insert_product(&product)
            .await
            .map_err(|e| uniqueness(e, ALREADY_EXISTS))?;

        tracing::info!(product_id = %product.id, slug = %product.slug, "Product created");

        let aggregate_id = *product.id.as_uuid();
        self.outbox
            .record(aggregate_id, MessageType::ProductCreate, now, &product);
        self.outbox.publish(
            topics::STORE_CREATE_LEDGER,
            CatalogMessage::CreateStores(CreateStores {
                product_id: product.id,
                quantity: cmd.quantity,
            }),
        );
        self.outbox.publish(
            topics::PRODUCT_CREATE_REPLICA,
            CatalogMessage::ProductCreated {
                meta: EventMeta {
                    aggregate_id,
                    message_type: MessageType::ProductCreate,
                    timestamp: now,
                },
                product: product.clone(),
            },
        );

        Ok(product)
    }

    /// Change catalog fields of an existing product.
    ///
    /// A blank name keeps the current one. The write is conditioned on
    /// `cmd.version`, the version the caller last read.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::Validation`] for malformed fields
    /// - [`CatalogError::NotFound`] if the product does not exist
    /// - [`CatalogError::Conflict`] if another product owns the name, or the
    ///   ledger has moved past `cmd.version`
    /// - [`CatalogError::Infrastructure`] if the ledger is unavailable
    pub async fn update(&self, cmd: UpdateProduct) -> Result<Product, CatalogError> {
        ensure_valid(self.validator.as_ref(), &cmd)?;

        let current = self
            .ledger
            .get_by_id(cmd.id)
            .await?
            .ok_or_else(|| CatalogError::not_found(format!("product id: {} not found", cmd.id)))?;

        let name = if cmd.name.trim().is_empty() {
            current.name.clone()
        } else {
            cmd.name
        };
        if let Some(owner) = self.ledger.find_product_by_name(&name).await? {
            if owner.id != cmd.id {
                return Err(CatalogError::conflict(ConflictKind::Uniqueness, NAME_TAKEN));
            }
        }

        let version = cmd.version.checked_add(1).ok_or_else(|| {
            CatalogError::conflict(ConflictKind::Version, format!("product id: {} version exhausted", cmd.id))
        })?;

        let now = self.clock.now();
        let product = Product {
            id: cmd.id,
            name,
            slug: cmd.slug,
            description: cmd.description,
            price: cmd.price,
            quantity: current.quantity,
            image: cmd.image,
            created_at: current.created_at,
            updated_at: Some(now),
            version,
            deleted: false,
        };

        self.ledger
            .update_product(&product)
            .await
            .map_err(|e| uniqueness(e, NAME_TAKEN))?;

        tracing::info!(product_id = %product.id, version = product.version, "Product updated");

        let aggregate_id = *product.id.as_uuid();
        self.outbox
            .record(aggregate_id, MessageType::ProductUpdate, now, &product);
        self.outbox.publish(
            topics::PRODUCT_UPDATE_REPLICA,
            CatalogMessage::ProductUpdated {
                meta: EventMeta {
                    aggregate_id,
                    message_type: MessageType::ProductUpdate,
                    timestamp: now,
                },
                product: product.clone(),
            },
        );

        Ok(product)
    }
}

/// Map a duplicate-key failure to a uniqueness conflict with `message`.
fn uniqueness(err: StorageError, message: &str) -> CatalogError {
    match err {
        StorageError::Duplicate(_) => CatalogError::conflict(ConflictKind::Uniqueness, message),
        other => other.into(),
    }
}
