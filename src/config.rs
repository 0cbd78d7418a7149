// src/config.rs
//
// All runtime configuration comes from the environment, read once at
// startup. Per-source cadence lives in the store, not here.

use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_uri: String,
    pub http_port: u16,
    pub cache_ttl_secs: u64,
    pub max_items_per_cycle: usize,
    pub detail_spacing_ms: u64,
    pub janitor_interval_secs: u64,
    pub retention_days: i64,
    pub event_buffer: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_uri: "cap-relay.db".to_string(),
            http_port: 8000,
            cache_ttl_secs: 300,
            max_items_per_cycle: 20,
            detail_spacing_ms: 100,
            janitor_interval_secs: 86_400,
            retention_days: 30,
            event_buffer: 256,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let d = AppConfig::default();
        Self {
            db_uri: std::env::var("DB_URI").unwrap_or(d.db_uri),
            http_port: env_parse("HTTP_PORT", d.http_port),
            cache_ttl_secs: env_parse("CACHE_TTL_SECS", d.cache_ttl_secs),
            max_items_per_cycle: env_parse("MAX_ITEMS_PER_CYCLE", d.max_items_per_cycle),
            detail_spacing_ms: env_parse("DETAIL_SPACING_MS", d.detail_spacing_ms),
            janitor_interval_secs: env_parse("JANITOR_INTERVAL_SECS", d.janitor_interval_secs),
            retention_days: env_parse("RETENTION_DAYS", d.retention_days),
            event_buffer: env_parse("EVENT_BUFFER", d.event_buffer),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
