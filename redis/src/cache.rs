//! Redis product cache.

use crate::document::{
    KEY_PREFIX, escape_query, from_fields, name_query, parse_search_reply, product_key, to_fields,
};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Value};
use std::collections::HashMap;
use stockroom_core::BoxFuture;
use stockroom_core::cache::FastCache;
use stockroom_core::error::StorageError;
use stockroom_core::model::{Product, ProductId};
use stockroom_core::reader::{ListQuery, ProductReader};

fn backend(context: &str, e: &RedisError) -> StorageError {
    StorageError::Backend(format!("{context}: {e}"))
}

/// Products stored as hashes under `product:{id}` and indexed by RediSearch.
///
/// Point lookups by id read the hash directly; slug lookups and listings go
/// through `FT.SEARCH`.
#[derive(Clone)]
pub struct RedisProductCache {
    conn_manager: ConnectionManager,
    index: String,
}

impl RedisProductCache {
    /// Connect and make sure the search index exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if Redis is unreachable or rejects
    /// the index definition.
    pub async fn new(redis_url: &str, index: impl Into<String>) -> Result<Self, StorageError> {
        let client =
            Client::open(redis_url).map_err(|e| backend("Failed to create Redis client", &e))?;
        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| backend("Failed to create Redis connection manager", &e))?;

        let cache = Self {
            conn_manager,
            index: index.into(),
        };
        cache.ensure_index().await?;
        Ok(cache)
    }

    /// Name of the search index.
    #[must_use]
    pub fn index(&self) -> &str {
        &self.index
    }

    /// Create the index unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] for any error other than "already exists".
    pub async fn ensure_index(&self) -> Result<(), StorageError> {
        let mut conn = self.conn_manager.clone();
        let created: Result<(), RedisError> = redis::cmd("FT.CREATE")
            .arg(&self.index)
            .arg(&["ON", "HASH", "PREFIX", "1", KEY_PREFIX, "SCHEMA"])
            .arg(&["id", "TAG"])
            .arg(&["name", "TEXT", "SORTABLE"])
            .arg(&["slug", "TAG"])
            .arg(&["description", "TEXT"])
            .arg(&["price", "NUMERIC"])
            .arg(&["quantity", "NUMERIC"])
            .arg(&["image", "TEXT", "NOINDEX"])
            .arg(&["version", "NUMERIC"])
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                tracing::info!(index = %self.index, "Search index created");
                Ok(())
            }
            Err(e) if e.to_string().contains("Index already exists") => Ok(()),
            Err(e) => Err(backend("Failed to create search index", &e)),
        }
    }

    async fn drop_index(&self) -> Result<(), StorageError> {
        let mut conn = self.conn_manager.clone();
        // DD removes the indexed hashes together with the index.
        let dropped: Result<(), RedisError> = redis::cmd("FT.DROPINDEX")
            .arg(&self.index)
            .arg("DD")
            .query_async(&mut conn)
            .await;

        match dropped {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("Unknown Index name") => Ok(()),
            Err(e) => Err(backend("Failed to drop search index", &e)),
        }
    }

    async fn search(&self, query: &str, offset: u64, limit: u32) -> Result<Vec<Product>, StorageError> {
        let mut conn = self.conn_manager.clone();
        let reply: Value = redis::cmd("FT.SEARCH")
            .arg(&self.index)
            .arg(query)
            .arg(&["SORTBY", "name", "ASC"])
            .arg("LIMIT")
            .arg(offset)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend("Search failed", &e))?;

        parse_search_reply(&reply)?
            .iter()
            .map(from_fields)
            .collect()
    }
}

impl ProductReader for RedisProductCache {
    fn get_by_id(&self, id: ProductId) -> BoxFuture<'_, Result<Option<Product>, StorageError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let fields: HashMap<String, String> = conn
                .hgetall(product_key(id))
                .await
                .map_err(|e| backend("Failed to read cached product", &e))?;
            if fields.is_empty() {
                return Ok(None);
            }
            from_fields(&fields).map(Some)
        })
    }

    fn get_by_slug<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Result<Option<Product>, StorageError>> {
        Box::pin(async move {
            let query = format!("@slug:{{{}}}", escape_query(slug));
            Ok(self.search(&query, 0, 1).await?.into_iter().next())
        })
    }

    fn list<'a>(&'a self, query: &'a ListQuery) -> BoxFuture<'a, Result<Vec<Product>, StorageError>> {
        Box::pin(async move {
            self.search(&name_query(query.name_filter()), query.offset(), query.size)
                .await
        })
    }
}

impl FastCache for RedisProductCache {
    fn set<'a>(&'a self, product: &'a Product) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let key = product_key(product.id);
            // Replace the whole hash so stale fields never survive an update.
            let _: () = redis::pipe()
                .atomic()
                .del(&key)
                .ignore()
                .hset_multiple(&key, &to_fields(product))
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| backend("Failed to cache product", &e))?;

            tracing::debug!(product_id = %product.id, version = product.version, "Product cached");
            Ok(())
        })
    }

    fn refresh<'a>(&'a self, products: &'a [Product]) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.drop_index().await?;
            self.ensure_index().await?;
            if products.is_empty() {
                return Ok(());
            }

            let mut conn = self.conn_manager.clone();
            let mut pipe = redis::pipe();
            for product in products {
                pipe.hset_multiple(product_key(product.id), &to_fields(product))
                    .ignore();
            }
            let _: () = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| backend("Failed to re-index products", &e))?;

            tracing::info!(index = %self.index, count = products.len(), "Cache refreshed");
            Ok(())
        })
    }
}
