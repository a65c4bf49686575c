//! Typed row mapping between Postgres and the domain model.
//!
//! Shared with the replica crate, whose read-model tables have the same shape.

use chrono::{DateTime, Utc};
use stockroom_core::error::StorageError;
use stockroom_core::model::{Product, ProductId, Store, StoreId};
use uuid::Uuid;

/// Column list for product queries. `$1` must be bound to "now" so the
/// derived quantity counts only slots available at that instant.
pub const PRODUCT_SELECT: &str = r"
    SELECT p.id, p.name, p.slug, p.description, p.price, p.image,
           p.created_at, p.updated_at, p.version, p.deleted,
           (SELECT COUNT(*) FROM stores s
             WHERE s.product_id = p.id
               AND NOT s.deleted AND NOT s.sold
               AND (s.booked_at IS NULL OR s.booked_at <= $1)) AS quantity
    FROM products p";

/// Column list for slot queries.
pub const STORE_SELECT: &str = r"
    SELECT id, product_id, booked_at, sold, created_at, updated_at, version, deleted
    FROM stores";

/// A `products` row joined with its derived quantity.
#[derive(Debug, sqlx::FromRow)]
pub struct ProductRow {
    id: Uuid,
    name: String,
    slug: String,
    description: String,
    price: f64,
    image: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    version: i32,
    deleted: bool,
    quantity: i64,
}

impl TryFrom<ProductRow> for Product {
    type Error = StorageError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: ProductId::from_uuid(row.id),
            name: row.name,
            slug: row.slug,
            description: row.description,
            price: row.price,
            quantity: u32::try_from(row.quantity).unwrap_or(u32::MAX),
            image: row.image,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: from_db_version(row.version)?,
            deleted: row.deleted,
        })
    }
}

/// A `stores` row.
#[derive(Debug, sqlx::FromRow)]
pub struct StoreRow {
    id: Uuid,
    product_id: Uuid,
    booked_at: Option<DateTime<Utc>>,
    sold: bool,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    version: i32,
    deleted: bool,
}

impl TryFrom<StoreRow> for Store {
    type Error = StorageError;

    fn try_from(row: StoreRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: StoreId::from_uuid(row.id),
            product_id: ProductId::from_uuid(row.product_id),
            booked_at: row.booked_at,
            sold: row.sold,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: from_db_version(row.version)?,
            deleted: row.deleted,
        })
    }
}

/// Convert a batch of rows, failing on the first bad one.
///
/// # Errors
///
/// Returns [`StorageError::Serialization`] if a row holds an out-of-range value.
pub fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, StorageError>
where
    T: TryFrom<R, Error = StorageError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Domain version to `INTEGER` column.
///
/// # Errors
///
/// Returns [`StorageError::Serialization`] past `i32::MAX`.
pub fn to_db_version(version: u32) -> Result<i32, StorageError> {
    i32::try_from(version)
        .map_err(|_| StorageError::Serialization(format!("version {version} out of range")))
}

fn from_db_version(version: i32) -> Result<u32, StorageError> {
    u32::try_from(version)
        .map_err(|_| StorageError::Serialization(format!("negative version {version}")))
}

/// Map a sqlx error, recognising unique violations.
#[must_use]
pub fn map_sqlx_error(context: &str, error: &sqlx::Error) -> StorageError {
    match error {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::Duplicate(format!("{context}: {}", db.message()))
        }
        other => StorageError::Backend(format!("{context}: {other}")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn negative_version_is_rejected() {
        let row = StoreRow {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            booked_at: None,
            sold: false,
            created_at: Utc::now(),
            updated_at: None,
            version: -1,
            deleted: false,
        };
        assert!(matches!(Store::try_from(row), Err(StorageError::Serialization(_))));
    }

    #[test]
    fn product_row_maps_every_field() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let row = ProductRow {
            id,
            name: "Lamp".into(),
            slug: "lamp".into(),
            description: "Desk lamp".into(),
            price: 12.5,
            image: "lamp.png".into(),
            created_at: now,
            updated_at: Some(now),
            version: 3,
            deleted: false,
            quantity: 7,
        };

        let product = Product::try_from(row).unwrap();
        assert_eq!(product.id, ProductId::from_uuid(id));
        assert_eq!(product.quantity, 7);
        assert_eq!(product.version, 3);
        assert_eq!(product.updated_at, Some(now));
    }

    #[test]
    fn version_over_i32_is_rejected() {
        assert!(to_db_version(u32::MAX).is_err());
        assert_eq!(to_db_version(5).unwrap(), 5);
    }
}
