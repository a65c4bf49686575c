//! Commands accepted by the product pipeline and the reservation engine.

use crate::model::{OrderId, ProductId, StoreId};
use crate::validation::{Field, FieldValue, Rule, Validate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const NAME: &[Rule] = &[Rule::Required, Rule::MaxLen(500)];
const NAME_OPTIONAL: &[Rule] = &[Rule::MaxLen(500)];
const SLUG: &[Rule] = &[Rule::Required, Rule::MaxLen(600)];
const DESCRIPTION: &[Rule] = &[Rule::MaxLen(10_000)];
const PRICE: &[Rule] = &[Rule::Required, Rule::Min(1.0)];
const PRICE_FLOOR: &[Rule] = &[Rule::Min(1.0)];
const QUANTITY: &[Rule] = &[Rule::Required, Rule::Min(1.0)];
const QUANTITY_OPTIONAL: &[Rule] = &[Rule::Min(1.0)];
const REQUIRED: &[Rule] = &[Rule::Required];

/// Register a new product and provision its initial slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateProduct {
    /// Identifier chosen by the caller
    pub id: ProductId,
    /// Display name
    pub name: String,
    /// URL slug
    pub slug: String,
    /// Description
    pub description: String,
    /// Unit price
    pub price: f64,
    /// Number of slots to provision
    pub quantity: u32,
    /// Image reference
    pub image: String,
}

impl Validate for CreateProduct {
    fn fields(&self) -> Vec<Field<'_>> {
        vec![
            Field::new("name", FieldValue::Text(&self.name), NAME),
            Field::new("slug", FieldValue::Text(&self.slug), SLUG),
            Field::new("description", FieldValue::Text(&self.description), DESCRIPTION),
            Field::new("price", FieldValue::Number(self.price), PRICE),
            Field::new("quantity", FieldValue::Number(f64::from(self.quantity)), QUANTITY),
        ]
    }
}

/// Change a product's catalog fields.
///
/// `version` is the version the caller last read; the update is rejected as
/// a conflict if the ledger has moved on since.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateProduct {
    /// Product to update
    pub id: ProductId,
    /// Display name
    pub name: String,
    /// URL slug
    pub slug: String,
    /// Description
    pub description: String,
    /// Unit price
    pub price: f64,
    /// Image reference
    pub image: String,
    /// Version last read by the caller
    pub version: u32,
}

impl Validate for UpdateProduct {
    fn fields(&self) -> Vec<Field<'_>> {
        vec![
            Field::new("id", FieldValue::Id(*self.id.as_uuid()), REQUIRED),
            Field::new("name", FieldValue::Text(&self.name), NAME_OPTIONAL),
            Field::new("slug", FieldValue::Text(&self.slug), SLUG),
            Field::new("description", FieldValue::Text(&self.description), DESCRIPTION),
            Field::new("price", FieldValue::Number(self.price), PRICE_FLOOR),
        ]
    }
}

/// Allocate `quantity` new available slots for a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateStores {
    /// Owning product
    pub product_id: ProductId,
    /// Number of slots
    pub quantity: u32,
}

impl Validate for CreateStores {
    fn fields(&self) -> Vec<Field<'_>> {
        vec![
            Field::new("product_id", FieldValue::Id(*self.product_id.as_uuid()), REQUIRED),
            Field::new("quantity", FieldValue::Number(f64::from(self.quantity)), QUANTITY_OPTIONAL),
        ]
    }
}

/// One product line of a booking request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLine {
    /// Product to book
    pub product_id: ProductId,
    /// Number of slots
    pub quantity: u32,
}

/// Hold slots for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookStores {
    /// Order the hold belongs to
    pub order_id: OrderId,
    /// Requested product lines
    pub products: Vec<BookLine>,
}

impl Validate for BookStores {
    fn fields(&self) -> Vec<Field<'_>> {
        let mut fields = vec![Field::new(
            "products",
            FieldValue::Count(self.products.len()),
            REQUIRED,
        )];
        for line in &self.products {
            fields.push(Field::new(
                "product_id",
                FieldValue::Id(*line.product_id.as_uuid()),
                REQUIRED,
            ));
            fields.push(Field::new(
                "quantity",
                FieldValue::Number(f64::from(line.quantity)),
                QUANTITY,
            ));
        }
        fields
    }
}

/// Release the hold on one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbookStore {
    /// Slot to release
    pub id: StoreId,
    /// Hold expiry the sender observed. When set, the release is skipped
    /// unless the slot still carries this exact hold.
    pub hold_until: Option<DateTime<Utc>>,
}

impl UnbookStore {
    /// Release whatever hold the slot carries.
    #[must_use]
    pub const fn new(id: StoreId) -> Self {
        Self { id, hold_until: None }
    }

    /// Release the slot only if its hold still expires at `at`.
    #[must_use]
    pub const fn expired(id: StoreId, at: DateTime<Utc>) -> Self {
        Self {
            id,
            hold_until: Some(at),
        }
    }
}

impl Validate for UnbookStore {
    fn fields(&self) -> Vec<Field<'_>> {
        vec![Field::new("id", FieldValue::Id(*self.id.as_uuid()), REQUIRED)]
    }
}

/// Settle payment for a set of slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayStores {
    /// Slots to mark as sold
    pub ids: Vec<StoreId>,
}

impl Validate for PayStores {
    fn fields(&self) -> Vec<Field<'_>> {
        let mut fields = vec![Field::new("stores", FieldValue::Count(self.ids.len()), REQUIRED)];
        fields.extend(
            self.ids
                .iter()
                .map(|id| Field::new("id", FieldValue::Id(*id.as_uuid()), REQUIRED)),
        );
        fields
    }
}
