// src/ingest/parser.rs
//
// CAP parsing: RSS index decode, per-identifier detail fetch with response
// cache and 404 HTML fallback, and transformation of the raw XML shape into
// the canonical alert record.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use quick_xml::de::from_str;
use serde::Deserialize;

use super::client::{FetchedBody, HttpFetcher};
use super::{
    extract_fetchxml_url, extract_identifier, extract_inline_alert, parse_cap_timestamp,
    strip_namespace_prefixes, AlertFetcher, RssItem,
};
use crate::model::{
    is_active_at, Alert, Area, Certainty, Info, KeyValue, MsgType, Scope, Severity, Source,
    Status, Urgency,
};
use crate::stats::ParserStats;

// ---- raw XML shapes (after namespace stripping) ----

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    item: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
pub struct CapAlertXml {
    pub identifier: Option<String>,
    pub sender: Option<String>,
    pub sent: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "msgType")]
    pub msg_type: Option<String>,
    pub scope: Option<String>,
    #[serde(default)]
    pub code: Vec<String>,
    pub note: Option<String>,
    pub references: Option<String>,
    pub incidents: Option<String>,
    #[serde(default)]
    pub info: Vec<CapInfoXml>,
}

#[derive(Debug, Deserialize)]
pub struct CapInfoXml {
    pub language: Option<String>,
    #[serde(default)]
    pub category: Vec<String>,
    pub event: Option<String>,
    #[serde(default, rename = "responseType")]
    pub response_type: Vec<String>,
    pub urgency: Option<String>,
    pub severity: Option<String>,
    pub certainty: Option<String>,
    pub effective: Option<String>,
    pub onset: Option<String>,
    pub expires: Option<String>,
    #[serde(rename = "senderName")]
    pub sender_name: Option<String>,
    pub headline: Option<String>,
    pub description: Option<String>,
    pub instruction: Option<String>,
    pub web: Option<String>,
    pub contact: Option<String>,
    #[serde(default)]
    pub parameter: Vec<CapKeyValueXml>,
    #[serde(default)]
    pub area: Vec<CapAreaXml>,
}

#[derive(Debug, Deserialize)]
pub struct CapAreaXml {
    #[serde(rename = "areaDesc")]
    pub area_desc: Option<String>,
    #[serde(default)]
    pub polygon: Vec<String>,
    #[serde(default)]
    pub circle: Vec<String>,
    #[serde(default)]
    pub geocode: Vec<CapKeyValueXml>,
    pub altitude: Option<f64>,
    pub ceiling: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct CapKeyValueXml {
    #[serde(rename = "valueName")]
    pub value_name: Option<String>,
    pub value: Option<String>,
}

/// Decode an RSS index document into its items.
pub fn parse_rss_items(xml: &str) -> Result<Vec<RssItem>> {
    let stripped = strip_namespace_prefixes(xml);
    let rss: Rss = from_str(&stripped).context("decoding RSS index")?;
    Ok(rss.channel.item)
}

/// Decode one CAP document. Returns `None` (with a log) on undecodable XML
/// so a single bad document never fails its batch.
pub fn parse_cap_document(
    xml: &str,
    source_id: i64,
    fallback_identifier: &str,
    now: DateTime<Utc>,
) -> Option<Alert> {
    let stripped = strip_namespace_prefixes(xml);
    match from_str::<CapAlertXml>(&stripped) {
        Ok(raw) => transform_alert(raw, source_id, fallback_identifier, now),
        Err(e) => {
            tracing::warn!(identifier = fallback_identifier, error = %e, "undecodable CAP XML");
            None
        }
    }
}

/// Shape the raw XML into the canonical record: singletons become lists via
/// serde, timestamps become instants, enums get their fallbacks, and raw
/// polygon/circle strings are preserved for the geometry normalizer.
pub fn transform_alert(
    raw: CapAlertXml,
    source_id: i64,
    fallback_identifier: &str,
    now: DateTime<Utc>,
) -> Option<Alert> {
    let identifier = raw
        .identifier
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback_identifier.trim().to_string());
    if identifier.is_empty() {
        tracing::warn!("dropping alert without identifier");
        return None;
    }

    let sender = raw
        .sender
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Unknown Sender".to_string());
    let sent = match raw.sent.as_deref().and_then(parse_cap_timestamp) {
        Some(t) => t,
        None => {
            tracing::debug!(identifier = %identifier, "missing or unparseable sent; using fetch time");
            now
        }
    };

    let info = raw
        .info
        .into_iter()
        .map(|i| transform_info(i, &sender))
        .collect::<Vec<_>>();
    if info.is_empty() {
        tracing::warn!(identifier = %identifier, "dropping alert without info blocks");
        return None;
    }

    let mut alert = Alert {
        id: None,
        source_id,
        identifier,
        sender,
        sent,
        status: Status::parse_or_default(raw.status.as_deref().unwrap_or_default()),
        msg_type: MsgType::parse_or_default(raw.msg_type.as_deref().unwrap_or_default()),
        scope: Scope::parse_or_default(raw.scope.as_deref().unwrap_or_default()),
        code: raw.code,
        note: raw.note,
        references: raw.references,
        incidents: raw.incidents,
        info,
        fetched_at: now,
        active: false,
        created_at: now,
        updated_at: now,
    };
    alert.active = is_active_at(&alert, now);
    Some(alert)
}

fn transform_info(raw: CapInfoXml, alert_sender: &str) -> Info {
    Info {
        language: raw.language,
        category: raw.category,
        event: raw
            .event
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "Unknown Event".to_string()),
        response_type: raw.response_type,
        urgency: Urgency::parse_or_default(raw.urgency.as_deref().unwrap_or_default()),
        severity: Severity::parse_or_default(raw.severity.as_deref().unwrap_or_default()),
        certainty: Certainty::parse_or_default(raw.certainty.as_deref().unwrap_or_default()),
        effective: raw.effective.as_deref().and_then(parse_cap_timestamp),
        onset: raw.onset.as_deref().and_then(parse_cap_timestamp),
        expires: raw.expires.as_deref().and_then(parse_cap_timestamp),
        sender_name: raw
            .sender_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| alert_sender.to_string()),
        headline: raw.headline,
        description: raw.description,
        instruction: raw.instruction,
        web: raw.web,
        contact: raw.contact,
        parameter: transform_key_values(raw.parameter),
        area: raw.area.into_iter().map(transform_area).collect(),
    }
}

fn transform_area(raw: CapAreaXml) -> Area {
    Area {
        area_desc: raw.area_desc.unwrap_or_default(),
        polygon: raw.polygon,
        circle: raw.circle,
        geocode: transform_key_values(raw.geocode),
        altitude: raw.altitude,
        ceiling: raw.ceiling,
        geo_json: None,
    }
}

fn transform_key_values(raw: Vec<CapKeyValueXml>) -> Vec<KeyValue> {
    raw.into_iter()
        .filter_map(|kv| {
            Some(KeyValue {
                value_name: kv.value_name?,
                value: kv.value.unwrap_or_default(),
            })
        })
        .collect()
}

// ---- the parser proper ----

#[derive(Debug, Clone)]
pub struct ParserCfg {
    /// RSS items consumed per cycle; keeps catch-up after an outage gradual.
    pub max_items: usize,
    /// Minimum delay between detail-fetch starts.
    pub detail_spacing: Duration,
    pub cache_ttl: Duration,
}

impl Default for ParserCfg {
    fn default() -> Self {
        Self {
            max_items: 20,
            detail_spacing: Duration::from_millis(100),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

pub struct CapParser {
    http: HttpFetcher,
    stats: Arc<ParserStats>,
    cfg: ParserCfg,
}

impl CapParser {
    pub fn new(cfg: ParserCfg, stats: Arc<ParserStats>) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(cfg.cache_ttl)?,
            stats,
            cfg,
        })
    }

    /// Fetch and canonicalize one alert. `Ok(None)` means the item was
    /// dropped (no detail URL, unrecoverable 404, undecodable XML); only
    /// transport-level failures surface as errors.
    pub async fn fetch_one_alert(
        &self,
        identifier: &str,
        source: &Source,
    ) -> Result<Option<Alert>> {
        let Some(base) = source.detail_base_url() else {
            tracing::warn!(source = %source.name, "source has no detailUrl metadata");
            return Ok(None);
        };
        let url = format!("{base}{identifier}");
        let now = Utc::now();

        if let Some(body) = self.http.cached(identifier) {
            self.stats.record_cache_hit();
            return Ok(parse_cap_document(&body, source.id, identifier, now));
        }

        self.stats.record_request();
        let fetched = match self.http.get(&url).await {
            Ok(f) => f,
            Err(e) => {
                self.stats.record_failure();
                return Err(e);
            }
        };

        let body = if fetched.status == reqwest::StatusCode::NOT_FOUND {
            match self.html_fallback(identifier, source).await {
                Ok(Some(b)) => b,
                Ok(None) => {
                    self.stats.record_failure();
                    return Ok(None);
                }
                Err(e) => {
                    self.stats.record_failure();
                    return Err(e);
                }
            }
        } else if !fetched.status.is_success() {
            self.stats.record_failure();
            bail!("HTTP {} fetching {url}", fetched.status);
        } else {
            fetched.body
        };

        match parse_cap_document(&body, source.id, identifier, now) {
            Some(alert) => {
                self.stats.record_success();
                self.http.cache_put(identifier.to_string(), body);
                Ok(Some(alert))
            }
            None => {
                self.stats.record_parse_failure();
                self.stats.record_failure();
                Ok(None)
            }
        }
    }

    /// 404 fallback: scrape the human-facing page for a `FetchXMLFile` link
    /// (re-fetched) or an inline `<alert>` block. Best-effort; sources
    /// without an `htmlUrl` skip it.
    async fn html_fallback(&self, identifier: &str, source: &Source) -> Result<Option<String>> {
        let Some(page_base) = source.html_page_url() else {
            tracing::debug!(source = %source.name, "404 without htmlUrl metadata; giving up");
            return Ok(None);
        };
        self.stats.record_html_fallback();

        let page = self.http.get(&format!("{page_base}{identifier}")).await?;
        if !page.status.is_success() {
            return Ok(None);
        }

        if let Some(href) = extract_fetchxml_url(&page.body) {
            let resolved = resolve_url(&href, &source.url);
            let xml: FetchedBody = self.http.get(&resolved).await?;
            if xml.status.is_success() {
                return Ok(Some(xml.body));
            }
            return Ok(None);
        }
        Ok(extract_inline_alert(&page.body))
    }
}

/// Resolve a possibly relative href against the source's feed URL.
fn resolve_url(href: &str, base: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Ok(base) = url::Url::parse(base) {
        if let Ok(resolved) = base.join(href) {
            return resolved.to_string();
        }
    }
    href.to_string()
}

#[async_trait::async_trait]
impl AlertFetcher for CapParser {
    async fn fetch_alerts(&self, source: &Source) -> Result<Vec<Alert>> {
        self.stats.record_request();
        let index = match self.http.get(&source.url).await {
            Ok(f) if f.status.is_success() => {
                self.stats.record_success();
                f
            }
            Ok(f) => {
                self.stats.record_failure();
                bail!("HTTP {} fetching index {}", f.status, source.url);
            }
            Err(e) => {
                self.stats.record_failure();
                return Err(e);
            }
        };

        let items = parse_rss_items(&index.body)?;
        let mut seen = std::collections::HashSet::new();
        let mut identifiers = Vec::new();
        for item in &items {
            match extract_identifier(item) {
                Some(id) => {
                    if seen.insert(id.clone()) {
                        identifiers.push(id);
                    }
                }
                None => tracing::warn!(
                    source = %source.name,
                    title = item.title.as_deref().unwrap_or_default(),
                    "dropping RSS item without identifier"
                ),
            }
        }
        if identifiers.len() > self.cfg.max_items {
            tracing::info!(
                source = %source.name,
                total = identifiers.len(),
                cap = self.cfg.max_items,
                "index larger than per-cycle cap; remainder picked up next cycle"
            );
            identifiers.truncate(self.cfg.max_items);
        }

        // Stagger detail-fetch starts, then await the whole batch; one bad
        // item never sinks its siblings.
        let spacing = self.cfg.detail_spacing;
        let fetches = identifiers.iter().enumerate().map(|(i, identifier)| {
            let identifier = identifier.clone();
            async move {
                tokio::time::sleep(spacing * (i as u32)).await;
                match self.fetch_one_alert(&identifier, source).await {
                    Ok(alert) => alert,
                    Err(e) => {
                        tracing::warn!(identifier = %identifier, error = %format!("{e:#}"), "detail fetch failed");
                        None
                    }
                }
            }
        });
        let alerts: Vec<Alert> = join_all(fetches).await.into_iter().flatten().collect();

        tracing::debug!(
            source = %source.name,
            items = items.len(),
            fetched = alerts.len(),
            "index processed"
        );
        Ok(alerts)
    }

    fn name(&self) -> &'static str {
        "cap-parser"
    }
}
