//! Redis fast cache for Stockroom.
//!
//! Products are denormalised into hashes and indexed with RediSearch so that
//! name searches and paged listings never touch a database. The cache holds
//! copies only: it is overwritten on every product event and rebuilt
//! wholesale by the daily refresh.
//!
//! # Example
//!
//! ```no_run
//! use stockroom_redis::RedisProductCache;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = RedisProductCache::new("redis://127.0.0.1:6379", "productsIndex").await?;
//! # Ok(())
//! # }
//! ```

mod cache;
pub mod document;

pub use cache::RedisProductCache;
