//! Periodic full rebuild of the fast cache from the replica.
//!
//! Incremental cache writes can drift; once a day, at a fixed low-traffic
//! time, the whole index is dropped and re-populated. A failed cycle is
//! retried after a short backoff instead of waiting for the next day.

use crate::notifier::alert;
use chrono::{DateTime, Days, NaiveTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use stockroom_core::cache::FastCache;
use stockroom_core::environment::Clock;
use stockroom_core::error::StorageError;
use stockroom_core::notifier::Notifier;
use stockroom_core::replica::ReplicaStore;
use tokio::sync::{Mutex, broadcast};

/// Rebuild timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildSettings {
    /// Daily rebuild time (UTC)
    pub daily_at: NaiveTime,
    /// Delay before the first cycle
    pub initial_delay: Duration,
    /// Retry delay after a failed cycle
    pub backoff: Duration,
}

impl Default for RebuildSettings {
    fn default() -> Self {
        Self {
            daily_at: NaiveTime::from_hms_opt(0, 3, 0).unwrap_or(NaiveTime::MIN),
            initial_delay: Duration::from_secs(2),
            backoff: Duration::from_secs(15),
        }
    }
}

/// What a cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// The cache now holds exactly this many products.
    Rebuilt(usize),
    /// The replica returned nothing, so the cache was left untouched.
    SkippedEmpty,
    /// Another cycle was already running.
    AlreadyRunning,
}

/// Next occurrence of `at` strictly after `now`.
#[must_use]
pub fn next_daily_run(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today.checked_add_days(Days::new(1)).unwrap_or(today)
    }
}

/// Cache rebuild scheduler.
#[derive(Clone)]
pub struct CacheRebuildScheduler {
    replica: Arc<dyn ReplicaStore>,
    cache: Arc<dyn FastCache>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: RebuildSettings,
    running: Arc<Mutex<()>>,
}

impl CacheRebuildScheduler {
    /// Build the scheduler.
    #[must_use]
    pub fn new(
        replica: Arc<dyn ReplicaStore>,
        cache: Arc<dyn FastCache>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: RebuildSettings,
    ) -> Self {
        Self {
            replica,
            cache,
            notifier,
            clock,
            settings,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Run one cycle unless one is already in progress.
    ///
    /// # Errors
    ///
    /// Returns the replica read or cache flush error.
    pub async fn rebuild_once(&self) -> Result<RebuildOutcome, StorageError> {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::debug!("Cache rebuild already running, skipping");
            return Ok(RebuildOutcome::AlreadyRunning);
        };

        let products = self.replica.all_products().await?;
        if products.is_empty() {
            tracing::warn!("Replica returned no products, cache left as is");
            return Ok(RebuildOutcome::SkippedEmpty);
        }

        self.cache.refresh(&products).await?;
        tracing::info!(count = products.len(), "Cache rebuilt");
        Ok(RebuildOutcome::Rebuilt(products.len()))
    }

    /// Run a cycle and decide how long to wait before the next one.
    pub async fn cycle(&self) -> Duration {
        match self.rebuild_once().await {
            Ok(_) => {
                let now = self.clock.now();
                let next = next_daily_run(now, self.settings.daily_at);
                tracing::info!(next_run = %next, "Next cache rebuild scheduled");
                (next - now).to_std().unwrap_or(self.settings.backoff)
            }
            Err(e) => {
                tracing::error!(error = %e, retry_in = ?self.settings.backoff, "Cache rebuild failed");
                alert(self.notifier.as_ref(), &format!("cache rebuild failed: {e}")).await;
                self.settings.backoff
            }
        }
    }

    /// Run one cycle in the background, outside the daily schedule.
    ///
    /// Failures are logged and reported like a scheduled cycle's; the
    /// schedule itself is unaffected.
    #[must_use]
    pub fn trigger(&self) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            match scheduler.rebuild_once().await {
                Ok(outcome) => tracing::info!(outcome = ?outcome, "Triggered cache rebuild finished"),
                Err(e) => {
                    tracing::error!(error = %e, "Triggered cache rebuild failed");
                    alert(scheduler.notifier.as_ref(), &format!("cache rebuild failed: {e}")).await;
                }
            }
        })
    }

    /// Spawn the scheduler as a background task.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Rebuild after the initial delay, then on schedule, until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(daily_at = %self.settings.daily_at, "Cache rebuild scheduler started");
        let mut delay = self.settings.initial_delay;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(delay) => {
                    delay = self.cycle().await;
                }
            }
        }
        tracing::info!("Cache rebuild scheduler stopped");
    }
}
