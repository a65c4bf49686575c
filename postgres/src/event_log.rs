//! Append-only event log on `PostgreSQL`.

use crate::rows::map_sqlx_error;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use stockroom_core::BoxFuture;
use stockroom_core::error::StorageError;
use stockroom_core::event_log::EventLog;
use stockroom_core::model::EventRecord;

/// Event log table, usually in a database separate from the ledger.
#[derive(Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
}

impl PostgresEventLog {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a small pool against `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Create the `event_sourcing` table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the migration fails.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations/event_log")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Migration failed: {e}")))
    }

    /// Records of one aggregate, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the query fails.
    pub async fn records_for(&self, aggregate_id: uuid::Uuid) -> Result<Vec<(String, String)>, StorageError> {
        sqlx::query_as(
            r"
            SELECT message_type, data FROM event_sourcing
            WHERE aggregate_id = $1
            ORDER BY timestamp
            ",
        )
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load event records", &e))
    }
}

impl EventLog for PostgresEventLog {
    fn append<'a>(&'a self, records: &'a [EventRecord]) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            if records.is_empty() {
                return Ok(());
            }
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO event_sourcing (id, aggregate_id, message_type, timestamp, data) ",
            );
            builder.push_values(records, |mut row, record| {
                row.push_bind(record.id)
                    .push_bind(record.aggregate_id)
                    .push_bind(record.message_type.as_str())
                    .push_bind(record.timestamp)
                    .push_bind(&record.data);
            });
            builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("append event records", &e))?;

            for record in records {
                metrics::counter!("event_log.appended", "message_type" => record.message_type.as_str())
                    .increment(1);
            }
            Ok(())
        })
    }
}
