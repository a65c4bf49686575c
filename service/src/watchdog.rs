//! Reservation expiry watchdog.
//!
//! Every booked slot must eventually return to `Available` if it is never
//! sold. The watchdog owns an in-memory watch set of `slot → hold expiry`
//! and, on every scan, publishes an `UnbookStore` command for each slot
//! whose hold has passed.
//!
//! The watch set is owned by a single task. The reservation engine feeds it
//! through a [`WatchdogHandle`], so there is no shared mutable state:
//!
//! ```text
//!  ReservationEngine ──WatchCommand──▶ mpsc ──▶ Watchdog task ──UnbookStore──▶ unbook-ledger topic
//!                                                   ▲
//!                                   scan every N s ─┘ (backoff after a failed publish)
//! ```

use crate::notifier::alert;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stockroom_core::command::UnbookStore;
use stockroom_core::environment::Clock;
use stockroom_core::error::StorageError;
use stockroom_core::event_bus::{EventBus, EventBusError, topics};
use stockroom_core::ledger::StoreLedger;
use stockroom_core::message::CatalogMessage;
use stockroom_core::model::{Store, StoreId};
use stockroom_core::notifier::Notifier;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// Message to the watchdog task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchCommand {
    /// Start (or keep) watching slots until their hold expiry.
    Track(Vec<(StoreId, Option<DateTime<Utc>>)>),
    /// Stop watching slots that were released or sold through another path.
    Forget(Vec<StoreId>),
}

/// Sending side held by the reservation engine.
#[derive(Clone, Debug)]
pub struct WatchdogHandle {
    tx: mpsc::UnboundedSender<WatchCommand>,
}

impl WatchdogHandle {
    /// Watch freshly booked slots.
    pub fn track(&self, stores: &[Store]) {
        let entries = stores.iter().map(|s| (s.id, s.booked_at)).collect();
        self.send(WatchCommand::Track(entries));
    }

    /// Stop watching slots.
    pub fn forget(&self, ids: Vec<StoreId>) {
        self.send(WatchCommand::Forget(ids));
    }

    fn send(&self, command: WatchCommand) {
        if self.tx.send(command).is_err() {
            tracing::warn!("Watchdog is not running, command dropped");
        }
    }
}

/// Scan timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSettings {
    /// Interval between scans
    pub scan_interval: Duration,
    /// Delay after a failed publish
    pub backoff: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(5),
            backoff: Duration::from_secs(15),
        }
    }
}

/// The watchdog task state.
pub struct Watchdog {
    ledger: Arc<dyn StoreLedger>,
    bus: Arc<dyn EventBus>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: WatchdogSettings,
    watch: HashMap<StoreId, Option<DateTime<Utc>>>,
    loaded: bool,
    rx: mpsc::UnboundedReceiver<WatchCommand>,
}

impl Watchdog {
    /// Create the watchdog and the handle that feeds it.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn StoreLedger>,
        bus: Arc<dyn EventBus>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: WatchdogSettings,
    ) -> (Self, WatchdogHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watchdog = Self {
            ledger,
            bus,
            notifier,
            clock,
            settings,
            watch: HashMap::new(),
            loaded: false,
            rx,
        };
        (watchdog, WatchdogHandle { tx })
    }

    /// Number of watched slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.watch.len()
    }

    /// Whether nothing is watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watch.is_empty()
    }

    /// Whether `id` is watched.
    #[must_use]
    pub fn is_watching(&self, id: StoreId) -> bool {
        self.watch.contains_key(&id)
    }

    /// Seed the watch set with every slot the ledger still shows as held.
    ///
    /// # Errors
    ///
    /// Returns the ledger error; the next scan tries again.
    pub async fn load(&mut self) -> Result<usize, StorageError> {
        let held = self.ledger.booked_stores(self.clock.now()).await?;
        let count = held.len();
        for store in held {
            self.watch.insert(store.id, store.booked_at);
        }
        self.loaded = true;
        tracing::info!(count, "Watchdog loaded held slots");
        Ok(count)
    }

    /// Apply a command from the engine.
    pub fn apply(&mut self, command: WatchCommand) {
        match command {
            WatchCommand::Track(entries) => self.watch.extend(entries),
            WatchCommand::Forget(ids) => {
                for id in ids {
                    self.watch.remove(&id);
                }
            }
        }
    }

    /// Apply every command already queued, without waiting.
    pub fn drain_commands(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            self.apply(command);
        }
    }

    /// Publish an unbook for every expired hold.
    ///
    /// Entries without an expiry are pruned. A slot leaves the watch set only
    /// once its unbook has been published; on the first publish failure the
    /// pass stops and the remaining entries stay for the next scan.
    ///
    /// # Errors
    ///
    /// Returns the publish error that stopped the pass.
    pub async fn scan(&mut self) -> Result<usize, EventBusError> {
        if !self.loaded {
            if let Err(e) = self.load().await {
                tracing::error!(error = %e, "Watchdog could not load held slots");
            }
        }

        let now = self.clock.now();
        self.watch.retain(|_, expiry| expiry.is_some());

        let mut due: Vec<(StoreId, DateTime<Utc>)> = self
            .watch
            .iter()
            .filter_map(|(id, expiry)| expiry.filter(|at| *at <= now).map(|at| (*id, at)))
            .collect();
        due.sort_by_key(|(id, at)| (*at, *id));

        let mut released = 0;
        for (id, at) in due {
            let command = CatalogMessage::UnbookStore(UnbookStore::expired(id, at));
            if let Err(e) = command
                .publish_to(self.bus.as_ref(), topics::STORE_UNBOOK_LEDGER)
                .await
            {
                tracing::error!(store_id = %id, error = %e, "Failed to publish unbook, backing off");
                alert(self.notifier.as_ref(), &format!("watchdog could not unbook store {id}: {e}")).await;
                return Err(e);
            }
            self.watch.remove(&id);
            released += 1;
            tracing::debug!(store_id = %id, "Expired hold released");
        }

        if self.watch.capacity() > 64 && self.watch.capacity() > self.watch.len() * 4 {
            self.watch.shrink_to_fit();
        }
        Ok(released)
    }

    /// Spawn the watchdog as a background task.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Load, then scan on a fixed interval until shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        if let Err(e) = self.load().await {
            tracing::error!(error = %e, "Watchdog could not load held slots, retrying on next scan");
        }
        tracing::info!(
            scan_interval = ?self.settings.scan_interval,
            watched = self.watch.len(),
            "Watchdog started"
        );

        let tick = tokio::time::sleep(self.settings.scan_interval);
        tokio::pin!(tick);
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                command = self.rx.recv(), if commands_open => match command {
                    Some(command) => self.apply(command),
                    None => commands_open = false,
                },
                () = &mut tick => {
                    self.drain_commands();
                    let delay = match self.scan().await {
                        Ok(_) => self.settings.scan_interval,
                        Err(_) => self.settings.backoff,
                    };
                    tick.as_mut().reset(Instant::now() + delay);
                }
            }
        }

        tracing::info!(watched = self.watch.len(), "Watchdog stopped");
    }
}
