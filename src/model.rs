//! Canonical alert and source records.
//!
//! Plain serde structs mirroring CAP 1.2 plus bookkeeping; no storage or
//! transport details. Active-bit computation and payload cleaning are free
//! functions so every writer shares the same definitions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::geometry::GeoJson;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Actual,
    Exercise,
    System,
    Test,
    Draft,
}

impl Status {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "actual" => Some(Status::Actual),
            "exercise" => Some(Status::Exercise),
            "system" => Some(Status::System),
            "test" => Some(Status::Test),
            "draft" => Some(Status::Draft),
            _ => None,
        }
    }

    /// Feeds misspell mandatory fields; fall back to `Actual` with a log.
    pub fn parse_or_default(s: &str) -> Self {
        Status::parse(s).unwrap_or_else(|| {
            tracing::debug!(value = s, "unrecognized status");
            Status::Actual
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    Alert,
    Update,
    Cancel,
    Ack,
    Error,
}

impl MsgType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alert" => Some(MsgType::Alert),
            "update" => Some(MsgType::Update),
            "cancel" => Some(MsgType::Cancel),
            "ack" => Some(MsgType::Ack),
            "error" => Some(MsgType::Error),
            _ => None,
        }
    }

    pub fn parse_or_default(s: &str) -> Self {
        MsgType::parse(s).unwrap_or_else(|| {
            tracing::debug!(value = s, "unrecognized msgType");
            MsgType::Alert
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Public,
    Restricted,
    Private,
}

impl Scope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Some(Scope::Public),
            "restricted" => Some(Scope::Restricted),
            "private" => Some(Scope::Private),
            _ => None,
        }
    }

    pub fn parse_or_default(s: &str) -> Self {
        Scope::parse(s).unwrap_or_else(|| {
            tracing::debug!(value = s, "unrecognized scope");
            Scope::Public
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Urgency {
    Immediate,
    Expected,
    Future,
    Past,
    Unknown,
}

impl Urgency {
    pub fn parse_or_default(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Urgency::Immediate,
            "expected" => Urgency::Expected,
            "future" => Urgency::Future,
            "past" => Urgency::Past,
            _ => Urgency::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Extreme,
    Severe,
    Moderate,
    Minor,
    Unknown,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "extreme" => Some(Severity::Extreme),
            "severe" => Some(Severity::Severe),
            "moderate" => Some(Severity::Moderate),
            "minor" => Some(Severity::Minor),
            "unknown" => Some(Severity::Unknown),
            _ => None,
        }
    }

    pub fn parse_or_default(s: &str) -> Self {
        Severity::parse(s).unwrap_or(Severity::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Extreme => "Extreme",
            Severity::Severe => "Severe",
            Severity::Moderate => "Moderate",
            Severity::Minor => "Minor",
            Severity::Unknown => "Unknown",
        }
    }

    /// Total order used for result ordering and the store's severity column.
    pub fn rank(&self) -> i64 {
        match self {
            Severity::Extreme => 4,
            Severity::Severe => 3,
            Severity::Moderate => 2,
            Severity::Minor => 1,
            Severity::Unknown => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Certainty {
    Observed,
    Likely,
    Possible,
    Unlikely,
    Unknown,
}

impl Certainty {
    pub fn parse_or_default(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "observed" => Certainty::Observed,
            "likely" => Certainty::Likely,
            "possible" => Certainty::Possible,
            "unlikely" => Certainty::Unlikely,
            _ => Certainty::Unknown,
        }
    }
}

/// `<valueName>/<value>` pair used by CAP `parameter` and `geocode` blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValue {
    pub value_name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Area {
    pub area_desc: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub polygon: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub circle: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geocode: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceiling: Option<f64>,
    /// Derived geometry; absent until normalization succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_json: Option<GeoJson>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category: Vec<String>,
    pub event: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_type: Vec<String>,
    pub urgency: Urgency,
    pub severity: Severity,
    pub certainty: Certainty,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onset: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameter: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub area: Vec<Area>,
}

/// Canonical alert record. Identity is `(source_id, identifier)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub source_id: i64,
    pub identifier: String,
    pub sender: String,
    pub sent: DateTime<Utc>,
    pub status: Status,
    pub msg_type: MsgType,
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incidents: Option<String>,
    pub info: Vec<Info>,
    pub fetched_at: DateTime<Utc>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An alert is active iff at least one info block expires in the future.
/// An info without `expires` never counts toward activity.
pub fn is_active_at(alert: &Alert, now: DateTime<Utc>) -> bool {
    alert
        .info
        .iter()
        .any(|i| i.expires.map(|e| e > now).unwrap_or(false))
}

/// Latest expiry across all info blocks, if any block carries one.
pub fn max_expires(alert: &Alert) -> Option<DateTime<Utc>> {
    alert.info.iter().filter_map(|i| i.expires).max()
}

/// Highest severity across info blocks (Unknown when there are none).
pub fn top_severity(alert: &Alert) -> Severity {
    alert
        .info
        .iter()
        .map(|i| i.severity)
        .max_by_key(|s| s.rank())
        .unwrap_or(Severity::Unknown)
}

/// Remove derived geometry from an incoming payload. Every writer calls this
/// before an upsert or insert: geometry is recomputed and attached separately
/// so an invalid pre-computed shape can never poison a spatially indexed
/// write.
pub fn strip_geometry(alert: &mut Alert) {
    for info in &mut alert.info {
        for area in &mut info.area {
            area.geo_json = None;
        }
    }
}

/// A configured upstream publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub active: bool,
    pub is_default: bool,
    pub fetch_interval_secs: u32,
    pub total_fetches: u64,
    pub successful_fetches: u64,
    pub failed_fetches: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_fetch_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Floor for `fetch_interval_secs`, enforced on every write.
pub const MIN_FETCH_INTERVAL_SECS: u32 = 30;

impl Source {
    /// Guard against timer drift and manual overrides: a source is due when
    /// it has never been fetched or its interval has elapsed.
    pub fn needs_fetching(&self, now: DateTime<Utc>) -> bool {
        match self.last_fetched_at {
            None => true,
            Some(t) => now - t >= Duration::seconds(i64::from(self.fetch_interval_secs)),
        }
    }

    /// Detail URL prefix the identifier is appended to.
    pub fn detail_base_url(&self) -> Option<&str> {
        self.metadata.get("detailUrl").and_then(Value::as_str)
    }

    /// Human-facing page prefix used by the 404 fallback.
    pub fn html_page_url(&self) -> Option<&str> {
        self.metadata.get("htmlUrl").and_then(Value::as_str)
    }
}

/// Payload for source creation; the store assigns id, counters, timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_interval")]
    pub fetch_interval_secs: u32,
    #[serde(default = "default_metadata")]
    pub metadata: Value,
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u32 {
    300
}

fn default_metadata() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Partial update for a source; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub country: Option<String>,
    pub language: Option<String>,
    pub active: Option<bool>,
    pub is_default: Option<bool>,
    pub fetch_interval_secs: Option<u32>,
    pub metadata: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn info_expiring(expires: Option<DateTime<Utc>>, severity: Severity) -> Info {
        Info {
            language: None,
            category: vec![],
            event: "Test Event".into(),
            response_type: vec![],
            urgency: Urgency::Unknown,
            severity,
            certainty: Certainty::Unknown,
            effective: None,
            onset: None,
            expires,
            sender_name: "Tester".into(),
            headline: None,
            description: None,
            instruction: None,
            web: None,
            contact: None,
            parameter: vec![],
            area: vec![],
        }
    }

    fn alert_with(info: Vec<Info>) -> Alert {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Alert {
            id: None,
            source_id: 1,
            identifier: "A1".into(),
            sender: "sender@example.org".into(),
            sent: ts,
            status: Status::Actual,
            msg_type: MsgType::Alert,
            scope: Scope::Public,
            code: vec![],
            note: None,
            references: None,
            incidents: None,
            info,
            fetched_at: ts,
            active: false,
            created_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn enum_parse_is_case_insensitive_with_fallbacks() {
        assert_eq!(Severity::parse("extreme"), Some(Severity::Extreme));
        assert_eq!(Severity::parse_or_default("catastrophic"), Severity::Unknown);
        assert_eq!(Status::parse_or_default("actual"), Status::Actual);
        assert_eq!(Status::parse_or_default("garbled"), Status::Actual);
        assert_eq!(MsgType::parse("CANCEL"), Some(MsgType::Cancel));
        assert_eq!(Scope::parse("nope"), None);
    }

    #[test]
    fn active_requires_a_future_expiry() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let future = now + Duration::hours(1);
        let past = now - Duration::hours(1);

        let a = alert_with(vec![info_expiring(Some(past), Severity::Minor)]);
        assert!(!is_active_at(&a, now));

        let b = alert_with(vec![
            info_expiring(Some(past), Severity::Minor),
            info_expiring(Some(future), Severity::Severe),
        ]);
        assert!(is_active_at(&b, now));
        assert_eq!(max_expires(&b), Some(future));
        assert_eq!(top_severity(&b), Severity::Severe);

        // No expires anywhere -> never active.
        let c = alert_with(vec![info_expiring(None, Severity::Extreme)]);
        assert!(!is_active_at(&c, now));
        assert_eq!(max_expires(&c), None);
    }

    #[test]
    fn strip_geometry_clears_every_area() {
        let mut info = info_expiring(None, Severity::Unknown);
        info.area.push(Area {
            area_desc: "somewhere".into(),
            polygon: vec!["10,20 10,30 20,30 20,20".into()],
            circle: vec![],
            geocode: vec![],
            altitude: None,
            ceiling: None,
            geo_json: Some(crate::geometry::GeoJson::Polygon(vec![vec![
                [20.0, 10.0],
                [30.0, 10.0],
                [30.0, 20.0],
                [20.0, 10.0],
            ]])),
        });
        let mut alert = alert_with(vec![info]);
        strip_geometry(&mut alert);
        assert!(alert.info[0].area[0].geo_json.is_none());
        // Raw strings survive for renormalization.
        assert_eq!(alert.info[0].area[0].polygon.len(), 1);
    }
}
