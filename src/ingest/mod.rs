// src/ingest/mod.rs
pub mod client;
pub mod janitor;
pub mod parser;
pub mod scheduler;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;

use crate::model::{Alert, Source};

/// Seam between the scheduler and the CAP parser; tests drive the scheduler
/// with stub implementations instead of the network.
#[async_trait::async_trait]
pub trait AlertFetcher: Send + Sync {
    async fn fetch_alerts(&self, source: &Source) -> Result<Vec<Alert>>;
    fn name(&self) -> &'static str;
}

/// One entry of an RSS index feed, already namespace-stripped.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct RssItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub guid: Option<String>,
    pub description: Option<String>,
}

/// Strip namespace prefixes from element tags so `cap:alert` and `alert`
/// decode identically. `xmlns` attributes are left alone; the decoder
/// ignores them.
pub fn strip_namespace_prefixes(xml: &str) -> String {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| Regex::new(r"<(/?)[A-Za-z][\w.-]*:").unwrap());
    re.replace_all(xml, "<$1").into_owned()
}

/// Identifier extraction cascade: `identifier=` query parameter in the link,
/// then a pure-digit guid (or the same parameter inside it), then a long
/// digit run anywhere in the title + description. First hit wins.
pub fn extract_identifier(item: &RssItem) -> Option<String> {
    static RE_PARAM: OnceCell<Regex> = OnceCell::new();
    static RE_DIGITS: OnceCell<Regex> = OnceCell::new();
    static RE_LONG: OnceCell<Regex> = OnceCell::new();
    let re_param = RE_PARAM.get_or_init(|| Regex::new(r"identifier=(\d+)").unwrap());
    let re_digits = RE_DIGITS.get_or_init(|| Regex::new(r"^\d+$").unwrap());
    let re_long = RE_LONG.get_or_init(|| Regex::new(r"\d{16,}").unwrap());

    if let Some(link) = &item.link {
        if let Some(c) = re_param.captures(link) {
            return Some(c[1].to_string());
        }
    }
    if let Some(guid) = &item.guid {
        let g = guid.trim();
        if re_digits.is_match(g) {
            return Some(g.to_string());
        }
        if let Some(c) = re_param.captures(g) {
            return Some(c[1].to_string());
        }
    }
    let haystack = format!(
        "{} {}",
        item.title.as_deref().unwrap_or_default(),
        item.description.as_deref().unwrap_or_default()
    );
    re_long.find(&haystack).map(|m| m.as_str().to_string())
}

/// Extract the `FetchXMLFile…identifier…` href from a human-facing fallback
/// page, if present.
pub fn extract_fetchxml_url(html: &str) -> Option<String> {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"(?i)href=["']([^"']*FetchXMLFile[^"']*identifier[^"']*)["']"#).unwrap()
    });
    re.captures(html).map(|c| c[1].to_string())
}

/// Extract an inline `<alert>…</alert>` block (prefixed or not) from a
/// fallback page.
pub fn extract_inline_alert(html: &str) -> Option<String> {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(?is)<(?:\w+:)?alert[\s>].*?</(?:\w+:)?alert\s*>").unwrap());
    re.find(html).map(|m| m.as_str().to_string())
}

/// Parse a CAP timestamp as an absolute instant. RFC 3339 first (the wire
/// format), then RFC 2822 (RSS dates), then a naive fallback treated as UTC.
pub fn parse_cap_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let t = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(t) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_prefers_link_parameter() {
        let item = RssItem {
            link: Some("https://example.org/FetchCAPDetails?identifier=1234".into()),
            guid: Some("9999".into()),
            ..Default::default()
        };
        assert_eq!(extract_identifier(&item), Some("1234".into()));
    }

    #[test]
    fn identifier_falls_back_to_guid_then_text() {
        let by_guid = RssItem {
            guid: Some(" 20240101123456789012 ".into()),
            ..Default::default()
        };
        assert_eq!(extract_identifier(&by_guid), Some("20240101123456789012".into()));

        let by_text = RssItem {
            title: Some("Flood warning".into()),
            description: Some("ref 12345678901234567890 issued".into()),
            ..Default::default()
        };
        assert_eq!(extract_identifier(&by_text), Some("12345678901234567890".into()));

        let nothing = RssItem {
            title: Some("short 123".into()),
            ..Default::default()
        };
        assert_eq!(extract_identifier(&nothing), None);
    }

    #[test]
    fn namespace_prefixes_are_stripped_from_tags() {
        let xml = r#"<cap:alert xmlns:cap="urn:oasis"><cap:identifier>1</cap:identifier></cap:alert>"#;
        let out = strip_namespace_prefixes(xml);
        assert!(out.starts_with("<alert"));
        assert!(out.contains("<identifier>1</identifier>"));
        assert!(out.ends_with("</alert>"));
    }

    #[test]
    fn timestamps_parse_in_all_accepted_shapes() {
        assert!(parse_cap_timestamp("2024-01-01T00:00:00+05:30").is_some());
        assert!(parse_cap_timestamp("Mon, 01 Jan 2024 12:34:56 GMT").is_some());
        assert!(parse_cap_timestamp("2024-01-01 06:00:00").is_some());
        assert!(parse_cap_timestamp("not a date").is_none());
    }

    #[test]
    fn inline_alert_block_is_found_case_insensitively() {
        let html = "<html><body><pre><CAP:ALERT xmlns=\"x\"><identifier>7</identifier></CAP:ALERT></pre></body></html>";
        let block = extract_inline_alert(html).unwrap();
        assert!(block.contains("<identifier>7</identifier>"));
    }
}
