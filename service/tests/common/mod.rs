//! In-memory harness shared by the scenario tests.
//!
//! Builds the whole service over `stockroom-testing` collaborators. Bus
//! consumers are not spawned; [`Harness::pump`] replays published messages
//! through the handlers instead, so every step is deterministic.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use stockroom::config::Config;
use stockroom::handlers::{EventHandler, LedgerCommandHandler, ReplicaHandler};
use stockroom::outbox::Outbox;
use stockroom::rebuild::CacheRebuildScheduler;
use stockroom::reservation::ReservationEngine;
use stockroom::watchdog::Watchdog;
use stockroom::{Catalog, Collaborators, Stockroom};
use stockroom_core::command::CreateProduct;
use stockroom_core::event_bus::topics;
use stockroom_core::message::CatalogMessage;
use stockroom_core::model::{Product, ProductId};
use stockroom_core::validation::RuleValidator;
use stockroom_testing::mocks::{ManualClock, manual_clock};
use stockroom_testing::{
    InMemoryCache, InMemoryEventBus, InMemoryEventLog, InMemoryLedger, InMemoryReplica,
    RecordingNotifier,
};
use tokio::sync::broadcast;

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub ledger: Arc<InMemoryLedger>,
    pub replica: Arc<InMemoryReplica>,
    pub cache: Arc<InMemoryCache>,
    pub log: Arc<InMemoryEventLog>,
    pub bus: Arc<InMemoryEventBus>,
    pub notifier: Arc<RecordingNotifier>,
    pub catalog: Catalog,
    pub outbox: Outbox,
    pub reservations: Arc<ReservationEngine>,
    pub ledger_handler: Arc<LedgerCommandHandler>,
    pub replica_handler: Arc<ReplicaHandler>,
    pub scheduler: CacheRebuildScheduler,
    pub watchdog: Watchdog,
    cursor: usize,
    _shutdown: broadcast::Sender<()>,
}

pub fn config() -> Config {
    Config::from_lookup(|_| None)
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&config())
    }

    pub fn with_config(config: &Config) -> Self {
        let clock = Arc::new(manual_clock());
        let ledger = Arc::new(InMemoryLedger::with_clock(clock.clone()));
        let replica = Arc::new(InMemoryReplica::with_clock(clock.clone()));
        let cache = Arc::new(InMemoryCache::new());
        let log = Arc::new(InMemoryEventLog::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let collab = Collaborators {
            product_ledger: ledger.clone(),
            store_ledger: ledger.clone(),
            event_log: log.clone(),
            replica: replica.clone(),
            cache: cache.clone(),
            bus: bus.clone(),
            notifier: notifier.clone(),
            validator: Arc::new(RuleValidator),
            clock: clock.clone(),
        };

        let Stockroom {
            catalog,
            outbox,
            reservations,
            ledger_handler,
            replica_handler,
            scheduler,
            outbox_worker,
            watchdog,
            ..
        } = Stockroom::assemble(collab, config);

        let (shutdown, rx) = broadcast::channel(1);
        let _ = outbox_worker.spawn(rx);

        Self {
            clock,
            ledger,
            replica,
            cache,
            log,
            bus,
            notifier,
            catalog,
            outbox,
            reservations,
            ledger_handler,
            replica_handler,
            scheduler,
            watchdog,
            cursor: 0,
            _shutdown: shutdown,
        }
    }

    /// Deliver everything published so far to the consumers, until the bus
    /// goes quiet.
    pub async fn pump(&mut self) {
        loop {
            self.outbox.settle().await;
            let published = self.bus.published();
            if self.cursor >= published.len() {
                return;
            }
            let batch = published[self.cursor..].to_vec();
            self.cursor = published.len();

            for (topic, event) in batch {
                if topics::LEDGER_COMMANDS.contains(&topic.as_str()) {
                    let _ = self.ledger_handler.handle(&event.data).await;
                } else if topics::REPLICA_UPDATES.contains(&topic.as_str()) {
                    let _ = self.replica_handler.handle(&event.data).await;
                }
            }
        }
    }

    /// Messages published on `topic`, decoded.
    pub fn messages_on(&self, topic: &str) -> Vec<CatalogMessage> {
        self.bus.messages_on(topic)
    }

    /// Create a product and let its slots be provisioned.
    pub async fn product_with(&mut self, name: &str, quantity: u32) -> Product {
        let product = self
            .catalog
            .create_product(create_product(name, quantity))
            .await
            .unwrap();
        self.pump().await;
        product
    }
}

pub fn create_product(name: &str, quantity: u32) -> CreateProduct {
    CreateProduct {
        id: ProductId::new(),
        name: name.to_string(),
        slug: name.to_lowercase().replace(' ', "-"),
        description: format!("{name} for testing"),
        price: 49.0,
        quantity,
        image: format!("{}.png", name.to_lowercase()),
    }
}
