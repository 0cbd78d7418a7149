// Shared helpers for the integration tests: record builders, an in-memory
// pipeline, and a stub fetcher standing in for the network.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};

use cap_relay::events::EventBus;
use cap_relay::ingest::scheduler::{Scheduler, SchedulerCfg};
use cap_relay::ingest::AlertFetcher;
use cap_relay::model::{
    Alert, Area, Certainty, Info, MsgType, NewSource, Scope, Severity, Source, Status, Urgency,
};
use cap_relay::stats::SchedulerStats;
use cap_relay::store::Store;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn info(expires: Option<DateTime<Utc>>, severity: Severity) -> Info {
    Info {
        language: Some("en".into()),
        category: vec!["Met".into()],
        event: "Test Event".into(),
        response_type: vec![],
        urgency: Urgency::Expected,
        severity,
        certainty: Certainty::Likely,
        effective: None,
        onset: None,
        expires,
        sender_name: "Test Sender".into(),
        headline: Some("Test headline".into()),
        description: None,
        instruction: None,
        web: None,
        contact: None,
        parameter: vec![],
        area: vec![],
    }
}

pub fn alert(
    source_id: i64,
    identifier: &str,
    sent: DateTime<Utc>,
    expires: Option<DateTime<Utc>>,
    severity: Severity,
) -> Alert {
    let active = expires.map(|e| e > Utc::now()).unwrap_or(false);
    Alert {
        id: None,
        source_id,
        identifier: identifier.to_string(),
        sender: "tests@example.org".into(),
        sent,
        status: Status::Actual,
        msg_type: MsgType::Alert,
        scope: Scope::Public,
        code: vec![],
        note: None,
        references: None,
        incidents: None,
        info: vec![info(expires, severity)],
        fetched_at: sent,
        active,
        created_at: sent,
        updated_at: sent,
    }
}

pub fn with_polygon(mut alert: Alert, polygon: &str) -> Alert {
    alert.info[0].area.push(Area {
        area_desc: "Test District".into(),
        polygon: vec![polygon.to_string()],
        circle: vec![],
        geocode: vec![],
        altitude: None,
        ceiling: None,
        geo_json: None,
    });
    alert
}

pub fn new_source(name: &str) -> NewSource {
    NewSource {
        name: name.to_string(),
        url: format!("https://feeds.example.org/{name}/rss.xml"),
        country: Some("IN".into()),
        language: Some("en".into()),
        active: true,
        is_default: false,
        fetch_interval_secs: 60,
        metadata: serde_json::json!({
            "detailUrl": format!("https://feeds.example.org/{name}/FetchXMLFile?identifier="),
        }),
    }
}

/// Stands in for the CAP parser: per-source canned alerts, per-source
/// simulated outages.
#[derive(Default)]
pub struct StubFetcher {
    alerts: Mutex<HashMap<i64, Vec<Alert>>>,
    failing: Mutex<HashSet<i64>>,
}

impl StubFetcher {
    pub fn set_alerts(&self, source_id: i64, alerts: Vec<Alert>) {
        self.alerts.lock().unwrap().insert(source_id, alerts);
    }

    pub fn set_failing(&self, source_id: i64, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(source_id);
        } else {
            set.remove(&source_id);
        }
    }
}

#[async_trait::async_trait]
impl AlertFetcher for StubFetcher {
    async fn fetch_alerts(&self, source: &Source) -> Result<Vec<Alert>> {
        if self.failing.lock().unwrap().contains(&source.id) {
            anyhow::bail!("simulated outage for {}", source.name);
        }
        Ok(self
            .alerts
            .lock()
            .unwrap()
            .get(&source.id)
            .cloned()
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

pub struct TestPipeline {
    pub store: Arc<Store>,
    pub fetcher: Arc<StubFetcher>,
    pub bus: EventBus,
    pub stats: Arc<SchedulerStats>,
    pub scheduler: Arc<Scheduler>,
}

pub async fn pipeline() -> TestPipeline {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let fetcher = Arc::new(StubFetcher::default());
    let bus = EventBus::new(64);
    let stats = Arc::new(SchedulerStats::default());
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&fetcher) as Arc<dyn AlertFetcher>,
        bus.clone(),
        Arc::clone(&stats),
        SchedulerCfg {
            janitor_interval: std::time::Duration::from_secs(3600),
            retention: Duration::days(30),
        },
    ));
    TestPipeline {
        store,
        fetcher,
        bus,
        stats,
        scheduler,
    }
}
