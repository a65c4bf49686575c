//! Operational alerts.

use stockroom_core::BoxFuture;
use stockroom_core::notifier::{Notifier, NotifyError};

/// Reports alerts as `error!` events. Outbound delivery (mail, chat) is
/// left to whatever ships the logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<(), NotifyError>> {
        tracing::error!(alert = %message, "Operational alert");
        Box::pin(async { Ok(()) })
    }
}

/// Send an alert, logging a delivery failure instead of returning it.
pub async fn alert(notifier: &dyn Notifier, message: &str) {
    if let Err(e) = notifier.send(message).await {
        tracing::warn!(error = %e, alert = %message, "Failed to deliver alert");
    }
}
