//! Operational alert sink for unrecoverable background failures.

use crate::BoxFuture;
use thiserror::Error;

/// Delivery failure.
#[derive(Error, Debug, Clone)]
#[error("Notification failed: {0}")]
pub struct NotifyError(pub String);

/// Notification collaborator. Callers never wait on delivery outcome beyond
/// logging it.
pub trait Notifier: Send + Sync {
    /// Send an alert.
    fn send<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<(), NotifyError>>;
}
