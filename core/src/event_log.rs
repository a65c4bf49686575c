//! Append-only audit trail of committed mutations.
//!
//! Written after the ledger commit and never read back in-band. Losing an
//! entry does not undo the mutation it describes.

use crate::BoxFuture;
use crate::error::StorageError;
use crate::model::EventRecord;

/// Event log sink.
pub trait EventLog: Send + Sync {
    /// Append records in order.
    fn append<'a>(&'a self, records: &'a [EventRecord]) -> BoxFuture<'a, Result<(), StorageError>>;
}
