// src/ingest/scheduler.rs
//
// The heart of the pipeline: one task per active source, each looping
// fetch -> reconcile -> emit on the source's own cadence. Cycles for one
// source never overlap (a per-source async lock also covers manual
// refresh); sources never affect each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::janitor::Janitor;
use super::AlertFetcher;
use crate::events::{EventBus, Topic};
use crate::model::{is_active_at, strip_geometry, Alert, Source};
use crate::stats::SchedulerStats;
use crate::store::alerts::ExistingAlert;
use crate::store::Store;

/// How many alerts one reconciliation batch carries.
const BATCH_SIZE: usize = 50;

/// Retry delay when a cycle cannot even read its source row.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SchedulerCfg {
    pub janitor_interval: Duration,
    pub retention: chrono::Duration,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            janitor_interval: Duration::from_secs(86_400),
            retention: chrono::Duration::days(30),
        }
    }
}

/// Summary of one fetch cycle, echoed by the refresh endpoint.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleOutcome {
    pub source_id: i64,
    pub source_name: String,
    pub success: bool,
    pub fetched: usize,
    pub new_alerts: usize,
    pub updated_alerts: usize,
    pub skipped_alerts: usize,
    pub expired_alerts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct ReconcileCounts {
    new_alerts: usize,
    updated_alerts: usize,
    skipped_alerts: usize,
}

pub struct Scheduler {
    store: Arc<Store>,
    fetcher: Arc<dyn AlertFetcher>,
    bus: EventBus,
    stats: Arc<SchedulerStats>,
    cfg: SchedulerCfg,
    tasks: Mutex<HashMap<i64, JoinHandle<()>>>,
    cycle_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    janitor_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        fetcher: Arc<dyn AlertFetcher>,
        bus: EventBus,
        stats: Arc<SchedulerStats>,
        cfg: SchedulerCfg,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            fetcher,
            bus,
            stats,
            cfg,
            tasks: Mutex::new(HashMap::new()),
            cycle_locks: Mutex::new(HashMap::new()),
            janitor_task: Mutex::new(None),
            shutdown,
        }
    }

    /// Snapshot active sources, spawn one polling task per source (each runs
    /// an immediate first cycle), and start the janitor.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let sources = self.store.get_active_sources().await?;
        tracing::info!(sources = sources.len(), fetcher = self.fetcher.name(), "scheduler starting");
        for source in &sources {
            self.spawn_source_task(source.id);
        }

        let janitor = Janitor::new(
            Arc::clone(&self.store),
            self.bus.clone(),
            Arc::clone(&self.stats),
            self.cfg.janitor_interval,
            self.cfg.retention,
        );
        let rx = self.shutdown.subscribe();
        let handle = tokio::spawn(janitor.run_loop(rx));
        *self.janitor_task.lock().expect("janitor slot poisoned") = Some(handle);
        Ok(())
    }

    /// Signal every task to finish its current cycle, then join them all.
    /// Idempotent; the scheduler is idle when this returns.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task map poisoned");
            tasks.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        let janitor = self.janitor_task.lock().expect("janitor slot poisoned").take();
        if let Some(handle) = janitor {
            let _ = handle.await;
        }
        tracing::info!("scheduler stopped");
    }

    /// React to an external config change: schedule the source if it is now
    /// active, cancel its timer if not. The next cycle picks up any new
    /// interval on its own.
    pub async fn update_source(self: &Arc<Self>, source_id: i64) {
        match self.store.get_source(source_id).await {
            Ok(Some(source)) if source.active => self.spawn_source_task(source_id),
            Ok(_) => self.remove_source_interval(source_id),
            Err(e) => {
                tracing::warn!(source_id, error = %format!("{e:#}"), "source re-evaluation failed")
            }
        }
    }

    /// Cancel and forget a source's timer.
    pub fn remove_source_interval(&self, source_id: i64) {
        if let Some(handle) = self
            .tasks
            .lock()
            .expect("task map poisoned")
            .remove(&source_id)
        {
            handle.abort();
            tracing::info!(source_id, "source timer cancelled");
        }
        self.cycle_locks
            .lock()
            .expect("cycle lock map poisoned")
            .remove(&source_id);
    }

    /// Run one synchronous cycle for one source (or every active source),
    /// bypassing the cadence guard but not the per-source cycle lock.
    pub async fn refresh(&self, source_id: Option<i64>) -> Result<Vec<CycleOutcome>> {
        let ids = match source_id {
            Some(id) => vec![id],
            None => self
                .store
                .get_active_sources()
                .await?
                .into_iter()
                .map(|s| s.id)
                .collect(),
        };
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, outcome)) = self.run_cycle(id, true).await {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    pub fn stats_snapshot(&self) -> crate::stats::SchedulerStatsSnapshot {
        self.stats.snapshot()
    }

    fn spawn_source_task(self: &Arc<Self>, source_id: i64) {
        let mut tasks = self.tasks.lock().expect("task map poisoned");
        if let Some(existing) = tasks.get(&source_id) {
            if !existing.is_finished() {
                return;
            }
        }
        let scheduler = Arc::clone(self);
        tasks.insert(
            source_id,
            tokio::spawn(async move { scheduler.source_loop(source_id).await }),
        );
    }

    /// Single-shot loop: each iteration runs one full cycle, then sleeps the
    /// source's interval, so cycles for this source can never overlap.
    async fn source_loop(self: Arc<Self>, source_id: i64) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let Some((delay, _)) = self.run_cycle(source_id, false).await else {
                // Source deleted or deactivated.
                break;
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.tasks
            .lock()
            .expect("task map poisoned")
            .remove(&source_id);
        tracing::debug!(source_id, "source loop exited");
    }

    fn cycle_lock(&self, source_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.cycle_locks
                .lock()
                .expect("cycle lock map poisoned")
                .entry(source_id)
                .or_default(),
        )
    }

    /// One fetch cycle. Returns the delay until the next cycle, or `None`
    /// when the source is gone (or inactive, for scheduled runs) and its
    /// timer should stop.
    pub async fn run_cycle(&self, source_id: i64, manual: bool) -> Option<(Duration, CycleOutcome)> {
        let lock = self.cycle_lock(source_id);
        let _guard = lock.lock().await;

        let source = match self.store.get_source(source_id).await {
            Ok(Some(source)) => source,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(source_id, error = %format!("{e:#}"), "cannot read source; retrying later");
                return Some((STORE_RETRY_DELAY, CycleOutcome {
                    source_id,
                    error: Some(format!("{e:#}")),
                    ..Default::default()
                }));
            }
        };
        if !source.active && !manual {
            return None;
        }
        let interval = Duration::from_secs(u64::from(source.fetch_interval_secs));
        let now = Utc::now();
        if !manual && !source.needs_fetching(now) {
            // Defensive guard against timer drift and out-of-band refreshes.
            return Some((interval, CycleOutcome {
                source_id,
                source_name: source.name.clone(),
                success: true,
                ..Default::default()
            }));
        }

        let mut outcome = CycleOutcome {
            source_id,
            source_name: source.name.clone(),
            success: true,
            ..Default::default()
        };

        let fetch_result = self.fetcher.fetch_alerts(&source).await;
        let fetch_error = fetch_result.as_ref().err().map(|e| format!("{e:#}"));
        if let Err(e) = self
            .store
            .record_fetch_attempt(source_id, fetch_result.is_ok(), fetch_error.clone())
            .await
        {
            tracing::warn!(source = %source.name, error = %format!("{e:#}"), "recording fetch attempt failed");
        }

        match fetch_result {
            Ok(parsed) => {
                outcome.fetched = parsed.len();
                match self.reconcile(&source, parsed, now).await {
                    Ok(counts) => {
                        outcome.new_alerts = counts.new_alerts;
                        outcome.updated_alerts = counts.updated_alerts;
                        outcome.skipped_alerts = counts.skipped_alerts;
                    }
                    Err(e) => {
                        outcome.success = false;
                        outcome.error = Some(format!("{e:#}"));
                        tracing::warn!(source = %source.name, error = %format!("{e:#}"), "reconciliation failed");
                    }
                }
            }
            Err(_) => {
                outcome.success = false;
                outcome.error = fetch_error;
                tracing::warn!(
                    source = %source.name,
                    error = outcome.error.as_deref().unwrap_or_default(),
                    "fetch failed; still repairing expired bits"
                );
            }
        }

        // Runs in both outcomes so the active view stays fresh while a
        // source is down.
        match self.store.mark_expired(now, Some(source_id)).await {
            Ok(flipped) => {
                for alert in &flipped {
                    self.bus.publish_alert(Topic::AlertExpire, alert);
                }
                self.stats.record_expired(flipped.len() as u64);
                outcome.expired_alerts = flipped.len();
            }
            Err(e) => {
                tracing::warn!(source = %source.name, error = %format!("{e:#}"), "expired-bit repair failed");
            }
        }

        let cycle_no = self.stats.record_cycle(outcome.success);
        tracing::info!(
            source = %source.name,
            fetched = outcome.fetched,
            new = outcome.new_alerts,
            updated = outcome.updated_alerts,
            skipped = outcome.skipped_alerts,
            expired = outcome.expired_alerts,
            success = outcome.success,
            "fetch cycle complete"
        );
        if cycle_no % 10 == 0 {
            tracing::info!(stats = ?self.stats.snapshot(), "scheduler stats");
        }

        Some((interval, outcome))
    }

    /// Diff the parsed batch against stored state and persist in batches.
    async fn reconcile(
        &self,
        source: &Source,
        parsed: Vec<Alert>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileCounts> {
        // A feed repeating an identifier must not trip the unique index;
        // the last occurrence wins.
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut deduped: Vec<Alert> = Vec::with_capacity(parsed.len());
        for alert in parsed {
            match index.get(&alert.identifier) {
                Some(&i) => deduped[i] = alert,
                None => {
                    index.insert(alert.identifier.clone(), deduped.len());
                    deduped.push(alert);
                }
            }
        }

        let identifiers: Vec<String> = deduped.iter().map(|a| a.identifier.clone()).collect();
        let existing = self.store.find_by_identifiers(source.id, &identifiers).await?;

        let mut counts = ReconcileCounts::default();
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        for alert in deduped {
            batch.push(alert);
            if batch.len() == BATCH_SIZE {
                self.process_batch(std::mem::take(&mut batch), &existing, now, &mut counts)
                    .await?;
            }
        }
        if !batch.is_empty() {
            self.process_batch(batch, &existing, now, &mut counts).await?;
        }
        Ok(counts)
    }

    async fn process_batch(
        &self,
        batch: Vec<Alert>,
        existing: &HashMap<String, ExistingAlert>,
        now: DateTime<Utc>,
        counts: &mut ReconcileCounts,
    ) -> Result<()> {
        let mut to_update = Vec::new();
        let mut to_insert = Vec::new();
        let mut skipped = 0usize;

        for mut alert in batch {
            // One shared cleaner for every write path: derived geometry is
            // recomputed after persist, never trusted from the payload.
            strip_geometry(&mut alert);
            alert.active = is_active_at(&alert, now);
            alert.fetched_at = now;
            alert.updated_at = now;

            match existing.get(&alert.identifier) {
                Some(prev) if prev.sent == alert.sent && prev.active == alert.active => {
                    skipped += 1;
                }
                Some(prev) if prev.sent == alert.sent && prev.active && !alert.active => {
                    // Same publication, merely aged out: the expired-bit
                    // repair at the end of this cycle flips it and emits
                    // the expire event.
                    skipped += 1;
                }
                Some(prev) => {
                    alert.id = Some(prev.id);
                    to_update.push(alert);
                }
                None => {
                    alert.created_at = now;
                    to_insert.push(alert);
                }
            }
        }

        let mut updated = 0usize;
        if !to_update.is_empty() {
            self.store.bulk_upsert(&to_update).await?;
            for mut alert in to_update {
                self.attach_geometry_soft(&mut alert).await;
                self.bus.publish_alert(Topic::AlertUpdate, &alert);
                updated += 1;
            }
        }

        let inserted = self.store.bulk_insert(to_insert).await?;
        let new_alerts = inserted.len();
        for mut alert in inserted {
            self.attach_geometry_soft(&mut alert).await;
            self.bus.publish_alert(Topic::AlertNew, &alert);
        }

        self.stats.record_new(new_alerts as u64);
        self.stats.record_updated(updated as u64);
        self.stats.record_skipped(skipped as u64);
        counts.new_alerts += new_alerts;
        counts.updated_alerts += updated;
        counts.skipped_alerts += skipped;
        Ok(())
    }

    /// Normalize geometry for a persisted alert and index it. Failures are
    /// soft: the alert stays stored without geometry, siblings are never
    /// affected, and the published record mirrors what the store holds.
    async fn attach_geometry_soft(&self, alert: &mut Alert) {
        let mut any = false;
        for info in &mut alert.info {
            for area in &mut info.area {
                area.geo_json = crate::geometry::normalize_area(&area.polygon, &area.circle);
                any |= area.geo_json.is_some();
            }
        }
        if !any {
            return;
        }
        if let Err(e) = self.store.attach_geometry(alert).await {
            tracing::warn!(
                identifier = %alert.identifier,
                error = %format!("{e:#}"),
                "geometry rejected at write time; alert stored without it"
            );
            strip_geometry(alert);
        }
    }
}
