// src/ingest/janitor.rs
//
// Coarse periodic sweep: repair active bits across every source, then purge
// inactive alerts past the retention horizon.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::events::{EventBus, Topic};
use crate::stats::SchedulerStats;
use crate::store::Store;

pub struct Janitor {
    store: Arc<Store>,
    bus: EventBus,
    stats: Arc<SchedulerStats>,
    interval: Duration,
    retention: chrono::Duration,
}

impl Janitor {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        stats: Arc<SchedulerStats>,
        interval: Duration,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            store,
            bus,
            stats,
            interval,
            retention,
        }
    }

    pub async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.sweep_at(Utc::now()).await;
        }
        tracing::debug!("janitor stopped");
    }

    /// One sweep at the given instant. Returns `(expired, purged)` counts.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> (usize, usize) {
        let expired = match self.store.mark_expired(now, None).await {
            Ok(flipped) => {
                for alert in &flipped {
                    self.bus.publish_alert(Topic::AlertExpire, alert);
                }
                self.stats.record_expired(flipped.len() as u64);
                flipped.len()
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "janitor mark-expired failed");
                0
            }
        };

        let cutoff = now - self.retention;
        let purged = match self.store.delete_old_inactive(cutoff).await {
            Ok(n) => {
                self.stats.record_cleaned(n as u64);
                n
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "janitor purge failed");
                0
            }
        };

        tracing::info!(expired, purged, "janitor sweep complete");
        (expired, purged)
    }
}
