//! Wiring.
//!
//! [`connect`] opens every backend named in [`Config`]; [`Stockroom::assemble`]
//! builds the components on top of any set of [`Collaborators`] (production
//! backends or the in-memory ones used in tests); [`Stockroom::start`] spawns
//! the background tasks.
//!
//! ```text
//!                ┌────────────── Catalog ──────────────┐
//!                │ ProductCommands  ReservationEngine  │
//!                │        ProductRepository            │
//!                └────────┬───────────────┬────────────┘
//!                         │ Outbox        │ WatchdogHandle
//!                         ▼               ▼
//!   OutboxWorker ── event log / bus / cache      Watchdog ── bus
//!   ledger consumer ── ReservationEngine
//!   replica consumer ── replica + cache          CacheRebuildScheduler
//! ```

use crate::catalog::Catalog;
use crate::config::Config;
use crate::handlers::{EventHandler, LedgerCommandHandler, ReplicaHandler};
use crate::notifier::LogNotifier;
use crate::outbox::{Outbox, OutboxTargets, OutboxWorker};
use crate::pipeline::ProductCommands;
use crate::read_repository::ProductRepository;
use crate::rebuild::{CacheRebuildScheduler, RebuildSettings};
use crate::reservation::{ReservationEngine, ReservationSettings};
use crate::runtime::{Application, EventConsumer, NamedTask};
use crate::watchdog::{Watchdog, WatchdogSettings};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use stockroom_core::cache::FastCache;
use stockroom_core::environment::{Clock, SystemClock};
use stockroom_core::event_bus::{EventBus, topics};
use stockroom_core::event_log::EventLog;
use stockroom_core::ledger::{ProductLedger, StoreLedger};
use stockroom_core::notifier::Notifier;
use stockroom_core::replica::ReplicaStore;
use stockroom_core::validation::{RuleValidator, Validator};
use stockroom_postgres::{PostgresEventLog, PostgresLedger};
use stockroom_projections::PostgresReplicaStore;
use stockroom_redis::RedisProductCache;
use stockroom_redpanda::RedpandaEventBus;
use tokio::sync::broadcast;
use tracing::info;

/// Every external collaborator the service talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Durable ledger, product side
    pub product_ledger: Arc<dyn ProductLedger>,
    /// Durable ledger, slot side
    pub store_ledger: Arc<dyn StoreLedger>,
    /// Audit trail
    pub event_log: Arc<dyn EventLog>,
    /// Replica store
    pub replica: Arc<dyn ReplicaStore>,
    /// Fast cache
    pub cache: Arc<dyn FastCache>,
    /// Message bus
    pub bus: Arc<dyn EventBus>,
    /// Alert sink
    pub notifier: Arc<dyn Notifier>,
    /// Command validator
    pub validator: Arc<dyn Validator>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

/// Open every backend named in the configuration and run migrations.
///
/// # Errors
///
/// Returns the first backend that cannot be reached or migrated.
pub async fn connect(config: &Config) -> anyhow::Result<Collaborators> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    info!("Connecting to ledger database...");
    let ledger = Arc::new(
        PostgresLedger::connect(&config.postgres.url, config.postgres.max_connections)
            .await
            .context("ledger connection failed")?
            .with_clock(Arc::clone(&clock)),
    );
    ledger.migrate().await.context("ledger migration failed")?;

    info!("Connecting to event log database...");
    let event_log = PostgresEventLog::connect(&config.event_log.url)
        .await
        .context("event log connection failed")?;
    event_log.migrate().await.context("event log migration failed")?;

    info!("Connecting to replica database...");
    let replica = PostgresReplicaStore::new_with_separate_db(&config.replica.url)
        .await
        .context("replica connection failed")?
        .with_clock(Arc::clone(&clock));
    replica.migrate().await.context("replica migration failed")?;

    info!("Connecting to fast cache...");
    let cache = RedisProductCache::new(&config.redis.url, config.redis.index.clone())
        .await
        .context("cache connection failed")?;

    info!("Connecting to event bus...");
    let bus = RedpandaEventBus::builder()
        .brokers(config.redpanda.brokers.clone())
        .consumer_group(config.redpanda.consumer_group.clone())
        .build()
        .context("event bus setup failed")?;

    info!("All backends connected");
    Ok(Collaborators {
        product_ledger: ledger.clone(),
        store_ledger: ledger,
        event_log: Arc::new(event_log),
        replica: Arc::new(replica),
        cache: Arc::new(cache),
        bus: Arc::new(bus),
        notifier: Arc::new(LogNotifier),
        validator: Arc::new(RuleValidator),
        clock,
    })
}

fn hold_window(secs: u64) -> chrono::Duration {
    chrono::Duration::from_std(Duration::from_secs(secs)).unwrap_or_else(|_| chrono::Duration::minutes(1))
}

/// Assembled service, background tasks not yet running.
pub struct Stockroom {
    /// Caller-facing operations
    pub catalog: Catalog,
    /// Side-effect queue shared by every component
    pub outbox: Outbox,
    /// Slot state machine
    pub reservations: Arc<ReservationEngine>,
    /// Bus consumer driving the reservation engine
    pub ledger_handler: Arc<LedgerCommandHandler>,
    /// Bus consumer feeding the replica and cache
    pub replica_handler: Arc<ReplicaHandler>,
    /// Periodic cache rebuild
    pub scheduler: CacheRebuildScheduler,
    /// Executes queued side effects
    pub outbox_worker: OutboxWorker,
    /// Expiry watchdog
    pub watchdog: Watchdog,
    bus: Arc<dyn EventBus>,
}

impl Stockroom {
    /// Build every component over `collab`.
    #[must_use]
    pub fn assemble(collab: Collaborators, config: &Config) -> Self {
        let (outbox, outbox_worker) = Outbox::new(
            config.outbox.capacity,
            OutboxTargets {
                event_log: Arc::clone(&collab.event_log),
                bus: Arc::clone(&collab.bus),
                cache: Arc::clone(&collab.cache),
            },
            Arc::clone(&collab.notifier),
        );

        let (watchdog, watchdog_handle) = Watchdog::new(
            Arc::clone(&collab.store_ledger),
            Arc::clone(&collab.bus),
            Arc::clone(&collab.notifier),
            Arc::clone(&collab.clock),
            WatchdogSettings {
                scan_interval: Duration::from_secs(config.watchdog.scan_secs),
                backoff: Duration::from_secs(config.watchdog.backoff_secs),
            },
        );

        let reservations = Arc::new(ReservationEngine::new(
            Arc::clone(&collab.store_ledger),
            Arc::clone(&collab.validator),
            outbox.clone(),
            watchdog_handle,
            Arc::clone(&collab.clock),
            ReservationSettings {
                hold_window: hold_window(config.reservation.hold_window_secs),
                conflict_retries: config.reservation.book_conflict_retries,
            },
        ));
        let commands = Arc::new(ProductCommands::new(
            Arc::clone(&collab.product_ledger),
            Arc::clone(&collab.validator),
            outbox.clone(),
            Arc::clone(&collab.clock),
        ));
        let reads = Arc::new(ProductRepository::new(
            Arc::clone(&collab.cache),
            Arc::clone(&collab.replica),
            Arc::clone(&collab.product_ledger),
            outbox.clone(),
            Arc::clone(&collab.clock),
        ));

        let scheduler = CacheRebuildScheduler::new(
            Arc::clone(&collab.replica),
            Arc::clone(&collab.cache),
            Arc::clone(&collab.notifier),
            Arc::clone(&collab.clock),
            RebuildSettings {
                daily_at: config.rebuild.daily_at,
                initial_delay: Duration::from_secs(config.rebuild.initial_delay_secs),
                backoff: Duration::from_secs(config.rebuild.backoff_secs),
            },
        );

        Self {
            catalog: Catalog::new(
                commands,
                Arc::clone(&reservations),
                reads,
                scheduler.clone(),
                config.operation_timeout(),
            ),
            outbox,
            ledger_handler: Arc::new(LedgerCommandHandler::new(Arc::clone(&reservations))),
            replica_handler: Arc::new(ReplicaHandler::new(collab.replica, collab.cache)),
            reservations,
            scheduler,
            outbox_worker,
            watchdog,
            bus: collab.bus,
        }
    }

    /// Spawn the outbox worker, bus consumers, watchdog and rebuild
    /// scheduler.
    #[must_use]
    pub fn start(self) -> (Catalog, Application) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let ledger_handler: Arc<dyn EventHandler> = self.ledger_handler;
        let replica_handler: Arc<dyn EventHandler> = self.replica_handler;

        let ledger_consumer = EventConsumer::new(
            "ledger-commands",
            &topics::LEDGER_COMMANDS,
            Arc::clone(&self.bus),
            ledger_handler,
        );
        let replica_consumer = EventConsumer::new(
            "replica-updates",
            &topics::REPLICA_UPDATES,
            Arc::clone(&self.bus),
            replica_handler,
        );

        // The outbox worker goes last so it drains what the others queued.
        let tasks = vec![
            NamedTask::new(
                ledger_consumer.name().to_string(),
                ledger_consumer.spawn(shutdown_tx.subscribe()),
            ),
            NamedTask::new(
                replica_consumer.name().to_string(),
                replica_consumer.spawn(shutdown_tx.subscribe()),
            ),
            NamedTask::new("watchdog", self.watchdog.spawn(shutdown_tx.subscribe())),
            NamedTask::new("cache-rebuild", self.scheduler.spawn(shutdown_tx.subscribe())),
            NamedTask::new("outbox", self.outbox_worker.spawn(shutdown_tx.subscribe())),
        ];

        (self.catalog, Application::new(tasks, shutdown_tx))
    }
}
