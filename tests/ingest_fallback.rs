// tests/ingest_fallback.rs
//
// The 404 fallback path's scraping pieces: FetchXMLFile link extraction and
// inline <alert> block recovery from a human-facing page.

use chrono::{TimeZone, Utc};

use cap_relay::ingest::parser::parse_cap_document;
use cap_relay::ingest::{extract_fetchxml_url, extract_inline_alert};
use cap_relay::model::Severity;

#[test]
fn fetchxml_link_is_extracted_from_the_page() {
    let html = include_str!("fixtures/fallback_page.html");
    assert_eq!(
        extract_fetchxml_url(html).as_deref(),
        Some("/cap_public_website/FetchXMLFile?identifier=20240101000000000001")
    );
    // No inline alert on this page.
    assert!(extract_inline_alert(html).is_none());
}

#[test]
fn pages_without_a_machine_link_yield_nothing() {
    let html = "<html><body><a href='/somewhere/else'>link</a></body></html>";
    assert!(extract_fetchxml_url(html).is_none());
    assert!(extract_inline_alert(html).is_none());
}

#[test]
fn inline_alert_block_parses_to_a_full_record() {
    let html = include_str!("fixtures/fallback_inline.html");
    assert!(extract_fetchxml_url(html).is_none());

    let block = extract_inline_alert(html).expect("inline block present");
    assert!(block.starts_with("<alert"));
    assert!(block.trim_end().ends_with("</alert>"));

    let now = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap();
    let alert = parse_cap_document(&block, 4, "20240101000000000002", now)
        .expect("inline alert parses");
    assert_eq!(alert.identifier, "20240101000000000002");
    assert_eq!(alert.info[0].severity, Severity::Moderate);
    assert_eq!(alert.info[0].sender_name, "State Disaster Management Authority");
    assert!(alert.active);
}
