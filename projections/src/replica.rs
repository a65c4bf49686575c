//! `PostgreSQL` replica store.

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::sync::Arc;
use stockroom_core::BoxFuture;
use stockroom_core::environment::{Clock, SystemClock};
use stockroom_core::error::StorageError;
use stockroom_core::model::{Product, ProductId, Store};
use stockroom_core::reader::{ListQuery, ProductReader};
use stockroom_core::replica::ReplicaStore;
use stockroom_postgres::rows::{PRODUCT_SELECT, ProductRow, convert_all, map_sqlx_error, to_db_version};

/// Read model of products and slots.
///
/// Quantity is derived from the replica's own slot rows at read time, the
/// same way the ledger derives it, so both tiers answer identically once
/// replication has caught up.
#[derive(Clone)]
pub struct PostgresReplicaStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresReplicaStore {
    /// Use an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
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

    /// Connect to the replica database, separate from the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the connection fails.
    pub async fn new_with_separate_db(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to connect: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Create the replica tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if migration fails.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Migration failed: {e}")))
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_one(&self, condition: &str, bind: Bind<'_>) -> Result<Option<Product>, StorageError> {
        let sql = format!("{PRODUCT_SELECT} WHERE {condition} AND NOT p.deleted");
        let query = sqlx::query_as::<_, ProductRow>(&sql).bind(self.clock.now());
        let query = match bind {
            Bind::Id(id) => query.bind(*id.as_uuid()),
            Bind::Text(text) => query.bind(text),
        };
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("replica fetch product", &e))?;
        row.map(Product::try_from).transpose()
    }
}

enum Bind<'a> {
    Id(ProductId),
    Text(&'a str),
}

impl ProductReader for PostgresReplicaStore {
    fn get_by_id(&self, id: ProductId) -> BoxFuture<'_, Result<Option<Product>, StorageError>> {
        Box::pin(async move { self.fetch_one("p.id = $2", Bind::Id(id)).await })
    }

    fn get_by_slug<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Result<Option<Product>, StorageError>> {
        Box::pin(async move { self.fetch_one("p.slug = $2", Bind::Text(slug)).await })
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
                .map_err(|e| map_sqlx_error("replica list products", &e))?;
            convert_all(rows)
        })
    }
}

impl ReplicaStore for PostgresReplicaStore {
    fn upsert_product<'a>(&'a self, product: &'a Product) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO products
                    (id, name, slug, description, price, image, created_at, updated_at, version, deleted)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    slug = EXCLUDED.slug,
                    description = EXCLUDED.description,
                    price = EXCLUDED.price,
                    image = EXCLUDED.image,
                    created_at = EXCLUDED.created_at,
                    updated_at = EXCLUDED.updated_at,
                    version = EXCLUDED.version,
                    deleted = EXCLUDED.deleted
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
            .bind(product.deleted)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("replica upsert product", &e))?;

            tracing::debug!(product_id = %product.id, version = product.version, "Replica product written");
            Ok(())
        })
    }

    fn upsert_stores<'a>(&'a self, stores: &'a [Store]) -> BoxFuture<'a, Result<(), StorageError>> {
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
            builder.push(
                " ON CONFLICT (id) DO UPDATE SET
                    product_id = EXCLUDED.product_id,
                    booked_at = EXCLUDED.booked_at,
                    sold = EXCLUDED.sold,
                    created_at = EXCLUDED.created_at,
                    updated_at = EXCLUDED.updated_at,
                    version = EXCLUDED.version,
                    deleted = EXCLUDED.deleted",
            );

            builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("replica upsert stores", &e))?;

            tracing::debug!(count = stores.len(), "Replica stores written");
            Ok(())
        })
    }

    fn all_products(&self) -> BoxFuture<'_, Result<Vec<Product>, StorageError>> {
        Box::pin(async move {
            let sql = format!("{PRODUCT_SELECT} WHERE NOT p.deleted ORDER BY p.name");
            let rows: Vec<ProductRow> = sqlx::query_as(&sql)
                .bind(self.clock.now())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("replica all products", &e))?;
            convert_all(rows)
        })
    }
}
