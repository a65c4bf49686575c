//! Durable ledger on `PostgreSQL`.

use crate::rows::{
    PRODUCT_SELECT, ProductRow, STORE_SELECT, StoreRow, convert_all, map_sqlx_error, to_db_version,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::sync::Arc;
use stockroom_core::BoxFuture;
use stockroom_core::environment::{Clock, SystemClock};
use stockroom_core::error::StorageError;
use stockroom_core::ledger::{ProductLedger, StoreLedger};
use stockroom_core::model::{Product, ProductId, Store, StoreId};
use stockroom_core::reader::{ListQuery, ProductReader};

/// Authoritative product and slot tables.
///
/// Every update is a compare-and-swap on `version`, and a statement that
/// matches no row is reported as [`StorageError::VersionConflict`].
///
/// # Example
///
/// ```ignore
/// let ledger = PostgresLedger::connect("postgres://localhost/stockroom", 10).await?;
/// ledger.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresLedger {
    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used to derive available quantities.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Open a pool against `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Create the ledger tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations/ledger")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Migration failed: {e}")))
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_product(&self, key: ProductKey<'_>) -> Result<Option<Product>, StorageError> {
        let condition = match key {
            ProductKey::Id(_) => "p.id = $2",
            ProductKey::Slug(_) => "p.slug = $2",
            ProductKey::Name(_) => "p.name = $2",
        };
        let sql = format!("{PRODUCT_SELECT} WHERE {condition} AND NOT p.deleted");
        let query = sqlx::query_as::<_, ProductRow>(&sql).bind(self.clock.now());
        let query = match key {
            ProductKey::Id(id) => query.bind(*id.as_uuid()),
            ProductKey::Slug(value) | ProductKey::Name(value) => query.bind(value),
        };
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch product", &e))?;
        row.map(Product::try_from).transpose()
    }

    async fn update_store_batch(&self, stores: &[Store]) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", &e))?;

        for store in stores {
            let previous = store.version.checked_sub(1).ok_or_else(|| conflict(store))?;
            let result = sqlx::query(
                r"
                UPDATE stores
                SET booked_at = $1, sold = $2, updated_at = $3, version = $4
                WHERE id = $5 AND version = $6 AND NOT deleted
                ",
            )
            .bind(store.booked_at)
            .bind(store.sold)
            .bind(store.updated_at)
            .bind(to_db_version(store.version)?)
            .bind(store.id.as_uuid())
            .bind(to_db_version(previous)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update store", &e))?;

            if result.rows_affected() == 0 {
                // Dropping the transaction rolls it back.
                drop(tx);
                metrics::counter!("ledger.version_conflicts", "entity" => "store").increment(1);
                tracing::debug!(store_id = %store.id, version = store.version, "Stale store update");
                return Err(conflict(store));
            }
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", &e))?;
        metrics::counter!("ledger.stores_updated").increment(stores.len() as u64);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum ProductKey<'a> {
    Id(ProductId),
    Slug(&'a str),
    Name(&'a str),
}

fn conflict(store: &Store) -> StorageError {
    StorageError::VersionConflict {
        entity: "store",
        id: store.id.to_string(),
    }
}

impl ProductReader for PostgresLedger {
    fn get_by_id(&self, id: ProductId) -> BoxFuture<'_, Result<Option<Product>, StorageError>> {
        Box::pin(async move { self.fetch_product(ProductKey::Id(id)).await })
    }

    fn get_by_slug<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Result<Option<Product>, StorageError>> {
        Box::pin(async move { self.fetch_product(ProductKey::Slug(slug)).await })
    }

    fn list<'a>(&'a self, query: &'a ListQuery) -> BoxFuture<'a, Result<Vec<Product>, StorageError>> {
        Box::pin(async move {
            let sql = format!(
                "{PRODUCT_SELECT}
                 WHERE NOT p.deleted AND ($2::TEXT IS NULL OR p.name ILIKE '%' || $2 || '%')
                 ORDER BY p.name
                 LIMIT $3 OFFSET $4"
            );
            let rows: Vec<ProductRow> = sqlx::query_as(&sql)
                .bind(self.clock.now())
                .bind(query.name_filter())
                .bind(i64::from(query.size))
                .bind(i64::try_from(query.offset()).unwrap_or(i64::MAX))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("list products", &e))?;
            convert_all(rows)
        })
    }
}

impl ProductLedger for PostgresLedger {
    fn insert_product<'a>(&'a self, product: &'a Product) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO products
                    (id, name, slug, description, price, image, created_at, updated_at, version, deleted)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE)
                ",
            )
            .bind(product.id.as_uuid())
            .bind(&product.name)
            .bind(&product.slug)
            .bind(&product.description)
            .bind(product.price)
            .bind(&product.image)
            .bind(product.created_at)
            .bind(product.updated_at)
            .bind(to_db_version(product.version)?)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert product", &e))?;

            tracing::debug!(product_id = %product.id, "Product inserted");
            Ok(())
        })
    }

    fn update_product<'a>(&'a self, product: &'a Product) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let conflict = || StorageError::VersionConflict {
                entity: "product",
                id: product.id.to_string(),
            };
            let previous = product.version.checked_sub(1).ok_or_else(conflict)?;

            let result = sqlx::query(
                r"
                UPDATE products
                SET name = $1, slug = $2, description = $3, price = $4, image = $5,
                    updated_at = $6, version = $7
                WHERE id = $8 AND version = $9 AND NOT deleted
                ",
            )
            .bind(&product.name)
            .bind(&product.slug)
            .bind(&product.description)
            .bind(product.price)
            .bind(&product.image)
            .bind(product.updated_at)
            .bind(to_db_version(product.version)?)
            .bind(product.id.as_uuid())
            .bind(to_db_version(previous)?)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update product", &e))?;

            if result.rows_affected() == 0 {
                metrics::counter!("ledger.version_conflicts", "entity" => "product").increment(1);
                return Err(conflict());
            }
            Ok(())
        })
    }

    fn find_product_by_name<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Product>, StorageError>> {
        Box::pin(async move { self.fetch_product(ProductKey::Name(name)).await })
    }
}

impl StoreLedger for PostgresLedger {
    fn insert_stores<'a>(&'a self, stores: &'a [Store]) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            if stores.is_empty() {
                return Ok(());
            }
            let versions = stores
                .iter()
                .map(|s| to_db_version(s.version))
                .collect::<Result<Vec<_>, _>>()?;

            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO stores (id, product_id, booked_at, sold, created_at, updated_at, version, deleted) ",
            );
            builder.push_values(stores.iter().zip(versions), |mut row, (store, version)| {
                row.push_bind(*store.id.as_uuid())
                    .push_bind(*store.product_id.as_uuid())
                    .push_bind(store.booked_at)
                    .push_bind(store.sold)
                    .push_bind(store.created_at)
                    .push_bind(store.updated_at)
                    .push_bind(version)
                    .push_bind(store.deleted);
            });

            builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("insert stores", &e))?;

            metrics::counter!("ledger.stores_created").increment(stores.len() as u64);
            Ok(())
        })
    }

    fn find_store(&self, id: StoreId) -> BoxFuture<'_, Result<Option<Store>, StorageError>> {
        Box::pin(async move {
            let sql = format!("{STORE_SELECT} WHERE id = $1 AND NOT deleted");
            let row: Option<StoreRow> = sqlx::query_as(&sql)
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("find store", &e))?;
            row.map(Store::try_from).transpose()
        })
    }

    fn available_stores(
        &self,
        product_id: ProductId,
        limit: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Store>, StorageError>> {
        Box::pin(async move {
            let sql = format!(
                "{STORE_SELECT}
                 WHERE product_id = $1 AND NOT deleted AND NOT sold
                   AND (booked_at IS NULL OR booked_at <= $2)
                 ORDER BY created_at, id
                 LIMIT $3"
            );
            let rows: Vec<StoreRow> = sqlx::query_as(&sql)
                .bind(product_id.as_uuid())
                .bind(now)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("available stores", &e))?;
            convert_all(rows)
        })
    }

    fn update_stores<'a>(&'a self, stores: &'a [Store]) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            if stores.is_empty() {
                return Ok(());
            }
            self.update_store_batch(stores).await
        })
    }

    fn booked_stores(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<Vec<Store>, StorageError>> {
        Box::pin(async move {
            let sql = format!("{STORE_SELECT} WHERE NOT sold AND NOT deleted AND booked_at >= $1");
            let rows: Vec<StoreRow> = sqlx::query_as(&sql)
                .bind(now)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("booked stores", &e))?;
            convert_all(rows)
        })
    }
}
