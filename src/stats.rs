//! In-memory pipeline counters.
//!
//! Monotonically increasing atomics with serializable snapshots, exposed via
//! the stats endpoint. The same increment sites feed the Prometheus
//! registry so `/metrics` and `/cap-alerts/stats` agree.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct ParserStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    cache_hits: AtomicU64,
    html_fallbacks: AtomicU64,
    parse_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParserStatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cache_hits: u64,
    pub html_fallbacks: u64,
    pub parse_failures: u64,
}

impl ParserStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        counter!("cap_parser_requests_total").increment(1);
    }

    pub fn record_success(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        counter!("cap_parser_successes_total").increment(1);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        counter!("cap_parser_failures_total").increment(1);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        counter!("cap_parser_cache_hits_total").increment(1);
    }

    pub fn record_html_fallback(&self) {
        self.html_fallbacks.fetch_add(1, Ordering::Relaxed);
        counter!("cap_parser_html_fallbacks_total").increment(1);
    }

    pub fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
        counter!("cap_parser_parse_failures_total").increment(1);
    }

    pub fn snapshot(&self) -> ParserStatsSnapshot {
        ParserStatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            html_fallbacks: self.html_fallbacks.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct SchedulerStats {
    cycles: AtomicU64,
    successful_cycles: AtomicU64,
    failed_cycles: AtomicU64,
    new_alerts: AtomicU64,
    updated_alerts: AtomicU64,
    skipped_alerts: AtomicU64,
    expired_alerts: AtomicU64,
    cleaned_alerts: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatsSnapshot {
    pub cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub new_alerts: u64,
    pub updated_alerts: u64,
    pub skipped_alerts: u64,
    pub expired_alerts: u64,
    pub cleaned_alerts: u64,
}

impl SchedulerStats {
    /// Returns the cycle ordinal so the caller can decide when to dump a
    /// full snapshot to the log.
    pub fn record_cycle(&self, success: bool) -> u64 {
        if success {
            self.successful_cycles.fetch_add(1, Ordering::Relaxed);
            counter!("cap_scheduler_cycles_total", "outcome" => "ok").increment(1);
        } else {
            self.failed_cycles.fetch_add(1, Ordering::Relaxed);
            counter!("cap_scheduler_cycles_total", "outcome" => "err").increment(1);
        }
        self.cycles.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_new(&self, n: u64) {
        self.new_alerts.fetch_add(n, Ordering::Relaxed);
        counter!("cap_alerts_new_total").increment(n);
    }

    pub fn record_updated(&self, n: u64) {
        self.updated_alerts.fetch_add(n, Ordering::Relaxed);
        counter!("cap_alerts_updated_total").increment(n);
    }

    pub fn record_skipped(&self, n: u64) {
        self.skipped_alerts.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_expired(&self, n: u64) {
        self.expired_alerts.fetch_add(n, Ordering::Relaxed);
        counter!("cap_alerts_expired_total").increment(n);
    }

    pub fn record_cleaned(&self, n: u64) {
        self.cleaned_alerts.fetch_add(n, Ordering::Relaxed);
        counter!("cap_alerts_cleaned_total").increment(n);
    }

    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            successful_cycles: self.successful_cycles.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
            new_alerts: self.new_alerts.load(Ordering::Relaxed),
            updated_alerts: self.updated_alerts.load(Ordering::Relaxed),
            skipped_alerts: self.skipped_alerts.load(Ordering::Relaxed),
            expired_alerts: self.expired_alerts.load(Ordering::Relaxed),
            cleaned_alerts: self.cleaned_alerts.load(Ordering::Relaxed),
        }
    }
}
