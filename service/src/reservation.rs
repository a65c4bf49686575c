//! Slot booking state machine.
//!
//! ```text
//!            book                pay
//! Available ──────▶ Booked ─────────────▶ Sold
//!     ▲               │
//!     └──── unbook ───┘  (explicit, or the watchdog once the hold expires)
//! ```
//!
//! Mutual exclusion between concurrent bookings comes entirely from the
//! ledger's per-row version check. A booking that loses the race re-reads
//! the available slots and tries again, a bounded number of times.

use chrono::SubsecRound;
use crate::outbox::Outbox;
use crate::watchdog::WatchdogHandle;
use std::sync::Arc;
use stockroom_core::command::{BookLine, BookStores, CreateStores, PayStores, UnbookStore};
use stockroom_core::environment::Clock;
use stockroom_core::error::{CatalogError, ConflictKind, StorageError};
use stockroom_core::event_bus::topics;
use stockroom_core::ledger::StoreLedger;
use stockroom_core::message::{CatalogMessage, EventMeta, OrderStatus};
use stockroom_core::model::{MessageType, Store, StoreId};
use stockroom_core::validation::{Validator, ensure_valid};
use stockroom_core::{DateTime, Utc};
use uuid::Uuid;

/// Message of the conflict returned when a product runs out of slots.
pub const NOT_ENOUGH_STORES: &str = "not enough stores";

/// Booking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationSettings {
    /// How long a booked slot stays held
    pub hold_window: chrono::Duration,
    /// Re-selection attempts after losing a version race
    pub conflict_retries: u32,
}

impl Default for ReservationSettings {
    fn default() -> Self {
        Self {
            hold_window: chrono::Duration::minutes(1),
            conflict_retries: 3,
        }
    }
}

/// Create, book, unbook and sell slots.
pub struct ReservationEngine {
    ledger: Arc<dyn StoreLedger>,
    validator: Arc<dyn Validator>,
    outbox: Outbox,
    watchdog: WatchdogHandle,
    clock: Arc<dyn Clock>,
    settings: ReservationSettings,
}

impl ReservationEngine {
    /// Build the engine.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn StoreLedger>,
        validator: Arc<dyn Validator>,
        outbox: Outbox,
        watchdog: WatchdogHandle,
        clock: Arc<dyn Clock>,
        settings: ReservationSettings,
    ) -> Self {
        Self {
            ledger,
            validator,
            outbox,
            watchdog,
            clock,
            settings,
        }
    }

    /// Allocate `quantity` available slots in one batch.
    ///
    /// Creation times are spaced by a microsecond so insertion order is also
    /// booking order.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::Validation`] for a nil product id or zero quantity
    /// - [`CatalogError::Infrastructure`] if the ledger rejects the batch
    pub async fn create_stores(&self, cmd: CreateStores) -> Result<Vec<Store>, CatalogError> {
        ensure_valid(self.validator.as_ref(), &cmd)?;

        let now = self.clock.now();
        let stores: Vec<Store> = (0..i64::from(cmd.quantity))
            .map(|i| Store::new(cmd.product_id, now + chrono::Duration::microseconds(i)))
            .collect();
        self.ledger.insert_stores(&stores).await?;

        tracing::info!(product_id = %cmd.product_id, count = stores.len(), "Stores created");

        let aggregate_id = *cmd.product_id.as_uuid();
        self.record_slots(MessageType::StoreCreate, now, &stores);
        self.outbox.publish(
            topics::STORE_CREATE_REPLICA,
            CatalogMessage::StoresCreated {
                meta: meta(aggregate_id, MessageType::StoreCreate, now),
                stores: stores.clone(),
            },
        );
        Ok(stores)
    }

    /// Hold slots for every line of an order.
    ///
    /// All or nothing: if any line cannot be satisfied, slots already booked
    /// for earlier lines are released and the order is canceled on the
    /// order-status topic.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::Validation`] for an empty or malformed request
    /// - [`CatalogError::Conflict`] with `"not enough stores"` when a product
    ///   has fewer available slots than requested
    /// - [`CatalogError::Infrastructure`] if the ledger is unavailable
    pub async fn book(&self, cmd: BookStores) -> Result<Vec<Store>, CatalogError> {
        ensure_valid(self.validator.as_ref(), &cmd)?;

        let mut booked: Vec<Store> = Vec::new();
        for line in &cmd.products {
            match self.book_line(line).await {
                Ok(mut stores) => booked.append(&mut stores),
                Err(e) => {
                    tracing::info!(
                        order_id = %cmd.order_id,
                        product_id = %line.product_id,
                        requested = line.quantity,
                        error = %e,
                        "Booking failed, canceling order"
                    );
                    self.compensate(booked).await;
                    self.outbox.publish(
                        topics::ORDER_STATUS,
                        CatalogMessage::OrderStatusChanged {
                            order_id: cmd.order_id,
                            status: OrderStatus::Canceled,
                            status_at: self.clock.now(),
                        },
                    );
                    return Err(e);
                }
            }
        }

        let now = self.clock.now();
        let aggregate_id = *cmd.order_id.as_uuid();
        tracing::info!(order_id = %cmd.order_id, count = booked.len(), "Stores booked");

        self.watchdog.track(&booked);
        self.record_slots(MessageType::StoreBook, now, &booked);
        self.outbox.publish(
            topics::STORE_BOOK_REPLICA,
            CatalogMessage::StoresBooked {
                meta: meta(aggregate_id, MessageType::StoreBook, now),
                order_id: cmd.order_id,
                stores: booked.clone(),
            },
        );
        self.outbox.publish(
            topics::ORDER_STORE_BOOKED,
            CatalogMessage::StoreOrderUpdate {
                order_id: cmd.order_id,
                stores: booked.clone(),
            },
        );
        Ok(booked)
    }

    async fn book_line(&self, line: &BookLine) -> Result<Vec<Store>, CatalogError> {
        let wanted = line.quantity as usize;
        let mut attempt = 0;
        loop {
            let now = self.clock.now();
            let mut stores = self
                .ledger
                .available_stores(line.product_id, line.quantity, now)
                .await?;
            if stores.len() < wanted {
                return Err(CatalogError::conflict(
                    ConflictKind::InsufficientStock,
                    NOT_ENOUGH_STORES,
                ));
            }

            for store in &mut stores {
                store.book(now, self.settings.hold_window);
            }

            match self.ledger.update_stores(&stores).await {
                Ok(()) => return Ok(stores),
                Err(StorageError::VersionConflict { id, .. }) if attempt < self.settings.conflict_retries => {
                    attempt += 1;
                    metrics::counter!("reservation.booking_retries").increment(1);
                    tracing::debug!(
                        product_id = %line.product_id,
                        store_id = %id,
                        attempt,
                        "Lost a booking race, re-selecting"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Release slots booked earlier in a request that then failed.
    async fn compensate(&self, mut booked: Vec<Store>) {
        if booked.is_empty() {
            return;
        }
        let now = self.clock.now();
        for store in &mut booked {
            store.release(now);
        }

        match self.ledger.update_stores(&booked).await {
            Ok(()) => {
                tracing::info!(count = booked.len(), "Released stores of a failed booking");
                self.record_slots(MessageType::StoreUnbook, now, &booked);
                self.outbox.publish(
                    topics::STORE_UNBOOK_REPLICA,
                    CatalogMessage::StoresUnbooked {
                        meta: meta(*booked[0].product_id.as_uuid(), MessageType::StoreUnbook, now),
                        stores: booked,
                    },
                );
            }
            Err(e) => {
                // The holds still lapse on their own once the window passes.
                tracing::error!(count = booked.len(), error = %e, "Failed to release stores of a failed booking");
            }
        }
    }

    /// Clear the hold on one slot.
    ///
    /// A nil id is a silent no-op and yields `None`. So is a command carrying
    /// `hold_until` when the slot no longer holds that exact expiry: the hold
    /// it was aimed at has already been replaced, paid or released.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::NotFound`] if the slot does not exist
    /// - [`CatalogError::Conflict`] if the slot changed concurrently
    /// - [`CatalogError::Infrastructure`] if the ledger is unavailable
    pub async fn unbook(&self, cmd: UnbookStore) -> Result<Option<Store>, CatalogError> {
        if cmd.id.is_nil() {
            return Ok(None);
        }
        ensure_valid(self.validator.as_ref(), &cmd)?;

        let mut store = self
            .ledger
            .find_store(cmd.id)
            .await?
            .ok_or_else(|| missing(cmd.id))?;
        if let Some(expected) = cmd.hold_until {
            // Postgres keeps microseconds only.
            let held = store.booked_at.map(|at| at.trunc_subsecs(6));
            if held != Some(expected.trunc_subsecs(6)) {
                tracing::debug!(
                    store_id = %store.id,
                    expected = %expected,
                    held = ?store.booked_at,
                    "Hold already replaced, skipping unbook"
                );
                return Ok(None);
            }
        }

        let now = self.clock.now();
        store.release(now);
        self.ledger.update_stores(std::slice::from_ref(&store)).await?;

        tracing::info!(store_id = %store.id, version = store.version, "Store unbooked");

        let aggregate_id = *store.product_id.as_uuid();
        self.watchdog.forget(vec![store.id]);
        self.record_slots(MessageType::StoreUnbook, now, std::slice::from_ref(&store));
        self.outbox.publish(
            topics::STORE_UNBOOK_REPLICA,
            CatalogMessage::StoresUnbooked {
                meta: meta(aggregate_id, MessageType::StoreUnbook, now),
                stores: vec![store.clone()],
            },
        );
        Ok(Some(store))
    }

    /// Mark slots as sold.
    ///
    /// Every id must exist; the batch is written atomically.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::Validation`] for an empty list or nil id
    /// - [`CatalogError::NotFound`] naming the first missing slot; nothing
    ///   is written in that case
    /// - [`CatalogError::Conflict`] if any slot changed concurrently
    /// - [`CatalogError::Infrastructure`] if the ledger is unavailable
    pub async fn pay(&self, cmd: PayStores) -> Result<Vec<Store>, CatalogError> {
        ensure_valid(self.validator.as_ref(), &cmd)?;

        let mut stores = Vec::with_capacity(cmd.ids.len());
        for id in &cmd.ids {
            let store = self.ledger.find_store(*id).await?.ok_or_else(|| missing(*id))?;
            stores.push(store);
        }

        let now = self.clock.now();
        for store in &mut stores {
            store.sell(now);
        }
        self.ledger.update_stores(&stores).await?;

        tracing::info!(count = stores.len(), "Stores paid");

        self.watchdog.forget(cmd.ids.clone());
        self.record_slots(MessageType::StorePayment, now, &stores);
        self.outbox.publish(
            topics::STORE_PAYMENT_REPLICA,
            CatalogMessage::StoresPaid {
                meta: meta(*stores[0].product_id.as_uuid(), MessageType::StorePayment, now),
                stores: stores.clone(),
            },
        );
        Ok(stores)
    }

    /// One event-log record per slot, keyed by the slot's product.
    fn record_slots(&self, message_type: MessageType, now: DateTime<Utc>, stores: &[Store]) {
        self.outbox
            .record_each(message_type, now, stores, |store| *store.product_id.as_uuid());
    }
}

const fn meta(aggregate_id: Uuid, message_type: MessageType, timestamp: DateTime<Utc>) -> EventMeta {
    EventMeta {
        aggregate_id,
        message_type,
        timestamp,
    }
}

fn missing(id: StoreId) -> CatalogError {
    CatalogError::not_found(format!("store id: {id} not found"))
}
