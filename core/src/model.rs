//! Products, inventory slots and event-log records.
//!
//! The slot lifecycle is encoded as methods on [`Store`]:
//!
//! ```text
//!            book()               sell()
//! Available ────────▶ Booked ─────────────▶ Sold
//!     ▲                 │
//!     └─── release() ───┘   (explicit unbook or watchdog expiry)
//! ```
//!
//! Every transition increments `version`. The ledger persists a transition
//! only if the stored row still carries `version - 1`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// The nil identifier, used by callers to mean "absent".
            #[must_use]
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }

            /// Access the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Whether this is the nil identifier.
            #[must_use]
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Identity of a product.
    ProductId
);
uuid_id!(
    /// Identity of a single inventory slot.
    StoreId
);
uuid_id!(
    /// Identity of an order in the external order subsystem.
    OrderId
);

/// A sellable catalog entry.
///
/// `quantity` is never stored: readers derive it from the product's
/// currently available slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Unique identifier
    pub id: ProductId,
    /// Display name, unique among non-deleted products
    pub name: String,
    /// URL slug, unique among non-deleted products
    pub slug: String,
    /// Free-form description
    pub description: String,
    /// Unit price
    pub price: f64,
    /// Available slot count (derived)
    pub quantity: u32,
    /// Image reference
    pub image: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency counter
    pub version: u32,
    /// Soft-delete flag
    pub deleted: bool,
}

/// One unit of sellable inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    /// Unique identifier
    pub id: StoreId,
    /// Owning product
    pub product_id: ProductId,
    /// Hold expiry; `None` means the slot has never been booked or was released
    pub booked_at: Option<DateTime<Utc>>,
    /// Permanently consumed
    pub sold: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last transition time
    pub updated_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency counter, starts at 0
    pub version: u32,
    /// Soft-delete flag
    pub deleted: bool,
}

/// Observable state of a slot at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Free to book
    Available,
    /// Reserved until the contained instant
    Booked(DateTime<Utc>),
    /// Consumed by a payment
    Sold,
    /// Soft-deleted
    Deleted,
}

impl Store {
    /// Allocate a new slot in the `Available` state.
    #[must_use]
    pub fn new(product_id: ProductId, now: DateTime<Utc>) -> Self {
        Self {
            id: StoreId::new(),
            product_id,
            booked_at: None,
            sold: false,
            created_at: now,
            updated_at: None,
            version: 0,
            deleted: false,
        }
    }

    /// State of the slot as seen at `now`.
    #[must_use]
    pub fn state(&self, now: DateTime<Utc>) -> SlotState {
        if self.deleted {
            SlotState::Deleted
        } else if self.sold {
            SlotState::Sold
        } else {
            match self.booked_at {
                Some(until) if until > now => SlotState::Booked(until),
                _ => SlotState::Available,
            }
        }
    }

    /// Whether the slot can be booked at `now`.
    #[must_use]
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == SlotState::Available
    }

    /// Place a hold that expires `hold` after `now`.
    pub fn book(&mut self, now: DateTime<Utc>, hold: Duration) {
        self.booked_at = Some(now + hold);
        self.touch(now);
    }

    /// Clear the hold, returning the slot to `Available` unless it was sold.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.booked_at = None;
        self.touch(now);
    }

    /// Mark the slot as sold and clear any hold.
    pub fn sell(&mut self, now: DateTime<Utc>) {
        self.booked_at = None;
        self.sold = true;
        self.touch(now);
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = Some(now);
    }
}

/// Kind of committed mutation recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Product created
    ProductCreate,
    /// Product updated
    ProductUpdate,
    /// Slots allocated
    StoreCreate,
    /// Slots booked
    StoreBook,
    /// Slot released
    StoreUnbook,
    /// Slots sold
    StorePayment,
}

impl MessageType {
    /// Stable wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ProductCreate => "product.create",
            Self::ProductUpdate => "product.update",
            Self::StoreCreate => "store.create",
            Self::StoreBook => "store.book",
            Self::StoreUnbook => "store.unbook",
            Self::StorePayment => "store.payment",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier
    pub id: Uuid,
    /// Aggregate the mutation applied to
    pub aggregate_id: Uuid,
    /// Mutation kind
    pub message_type: MessageType,
    /// When the mutation was committed
    pub timestamp: DateTime<Utc>,
    /// JSON snapshot of the resulting entity state
    pub data: String,
}

impl EventRecord {
    /// Build a record carrying a JSON snapshot of `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if `state` cannot be serialized to JSON.
    pub fn snapshot<T: Serialize>(
        aggregate_id: Uuid,
        message_type: MessageType,
        timestamp: DateTime<Utc>,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_id,
            message_type,
            timestamp,
            data: serde_json::to_string(state)?,
        })
    }
}
