//! # Stockroom Testing
//!
//! In-memory implementations of every collaborator the engine talks to, so
//! the pipeline, reservation engine, watchdog and read repository can be
//! exercised without Postgres, Redis or Kafka.
//!
//! Every store supports failure injection through `set_failing(true)`, which
//! makes each call return [`StorageError::Backend`](stockroom_core::error::StorageError).
//!
//! ## Example
//!
//! ```ignore
//! use stockroom_testing::{InMemoryLedger, InMemoryEventBus, mocks::test_clock};
//!
//! let ledger = Arc::new(InMemoryLedger::new());
//! let bus = Arc::new(InMemoryEventBus::new());
//! bus.set_failing(true); // every publish now fails
//! ```

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only poisoned locks panic

mod bus;
mod ledger;
mod stores;

pub use bus::InMemoryEventBus;
pub use ledger::InMemoryLedger;
pub use stores::{InMemoryCache, InMemoryEventLog, InMemoryReplica, RecordingNotifier};

use stockroom_core::error::StorageError;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared failure switch.
#[derive(Debug, Default)]
pub(crate) struct FailureSwitch(AtomicBool);

impl FailureSwitch {
    pub(crate) fn set(&self, failing: bool) {
        self.0.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn check(&self, what: &str) -> Result<(), StorageError> {
        if self.0.load(Ordering::SeqCst) {
            Err(StorageError::Backend(format!("injected failure: {what}")))
        } else {
            Ok(())
        }
    }
}

/// Clocks for deterministic tests.
pub mod mocks {
    use chrono::{DateTime, Duration, Utc};
    use std::sync::Mutex;
    use stockroom_core::environment::Clock;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Used to step past hold windows without sleeping.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move forward by `by`.
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap() = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(epoch())
    }

    /// Create a manual clock starting at 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn manual_clock() -> ManualClock {
        ManualClock::new(epoch())
    }
}
