// tests/store_alerts.rs
//
// Alert store contracts against an in-memory database: the unique key,
// ordering, the spatial index path, lifecycle flips, and retention.

mod common;

use chrono::{Duration, TimeZone, Utc};

use cap_relay::geometry::{normalize_area, GeoJson};
use cap_relay::model::Severity;
use cap_relay::store::Store;
use common::{alert, t0, with_polygon};

#[tokio::test]
async fn source_and_identifier_form_the_unique_key() {
    let store = Store::open_in_memory().await.unwrap();
    let future = Utc::now() + Duration::hours(6);

    let a = alert(1, "A-1", t0(), Some(future), Severity::Minor);
    store.bulk_insert(vec![a.clone()]).await.unwrap();

    // Same identifier, same source: rejected.
    assert!(store.bulk_insert(vec![a.clone()]).await.is_err());

    // Same identifier under a different source id is a separate record.
    let mut other = a.clone();
    other.source_id = 2;
    store.bulk_insert(vec![other]).await.unwrap();
    assert_eq!(store.find_active().await.unwrap().len(), 2);
}

#[tokio::test]
async fn find_active_orders_by_severity_then_recency() {
    let store = Store::open_in_memory().await.unwrap();
    let future = Utc::now() + Duration::hours(6);

    store
        .bulk_insert(vec![
            alert(1, "minor-old", t0(), Some(future), Severity::Minor),
            alert(1, "extreme-old", t0(), Some(future), Severity::Extreme),
            alert(
                1,
                "extreme-new",
                t0() + Duration::hours(1),
                Some(future),
                Severity::Extreme,
            ),
            // Expired: must not appear at all.
            alert(1, "stale", t0(), Some(Utc::now() - Duration::hours(1)), Severity::Extreme),
        ])
        .await
        .unwrap();

    let active = store.find_active().await.unwrap();
    let order: Vec<&str> = active.iter().map(|a| a.identifier.as_str()).collect();
    assert_eq!(order, vec!["extreme-new", "extreme-old", "minor-old"]);
}

#[tokio::test]
async fn upsert_rewrites_in_place_without_duplicating() {
    let store = Store::open_in_memory().await.unwrap();
    let future = Utc::now() + Duration::hours(6);

    let inserted = store
        .bulk_insert(vec![alert(1, "U-1", t0(), Some(future), Severity::Minor)])
        .await
        .unwrap();
    let id = inserted[0].id.unwrap();

    let mut newer = alert(1, "U-1", t0() + Duration::hours(1), Some(future), Severity::Severe);
    newer.id = Some(id);
    assert_eq!(store.bulk_upsert(&[newer]).await.unwrap(), 1);

    let reread = store.find_by_identifier("U-1").await.unwrap().unwrap();
    assert_eq!(reread.id, Some(id));
    assert_eq!(reread.sent, t0() + Duration::hours(1));
    assert_eq!(reread.info[0].severity, Severity::Severe);
    assert_eq!(store.find_active().await.unwrap().len(), 1);

    // Upserting an identifier nobody stored touches nothing.
    assert_eq!(
        store
            .bulk_upsert(&[alert(1, "ghost", t0(), Some(future), Severity::Minor)])
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn find_by_identifiers_returns_the_diff_view() {
    let store = Store::open_in_memory().await.unwrap();
    let future = Utc::now() + Duration::hours(6);
    store
        .bulk_insert(vec![alert(1, "D-1", t0(), Some(future), Severity::Minor)])
        .await
        .unwrap();

    let map = store
        .find_by_identifiers(1, &["D-1".to_string(), "D-2".to_string()])
        .await
        .unwrap();
    assert_eq!(map.len(), 1);
    let existing = &map["D-1"];
    assert_eq!(existing.sent, t0());
    assert!(existing.active);

    // Scoped by source.
    assert!(store
        .find_by_identifiers(2, &["D-1".to_string()])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn geometry_attaches_and_answers_point_queries() {
    let store = Store::open_in_memory().await.unwrap();
    let future = Utc::now() + Duration::hours(6);

    // Triangle with interior lat < lon so the bounding box over-approximates.
    let a = with_polygon(
        alert(1, "G-1", t0(), Some(future), Severity::Severe),
        "0,0 0,10 10,10",
    );
    let mut stored = store.bulk_insert(vec![a]).await.unwrap().remove(0);
    stored.info[0].area[0].geo_json =
        normalize_area(&stored.info[0].area[0].polygon, &[]);
    store.attach_geometry(&stored).await.unwrap();

    let inside = store.find_by_point(8.0, 2.0).await.unwrap();
    assert_eq!(inside.len(), 1);
    assert_eq!(inside[0].identifier, "G-1");

    // Inside the bounding box but outside the triangle.
    assert!(store.find_by_point(2.0, 8.0).await.unwrap().is_empty());
    // Outside everything.
    assert!(store.find_by_point(120.0, 45.0).await.unwrap().is_empty());

    let reread = store.find_by_identifier("G-1").await.unwrap().unwrap();
    assert!(matches!(
        reread.info[0].area[0].geo_json,
        Some(GeoJson::Polygon(_))
    ));
}

#[tokio::test]
async fn invalid_geometry_is_rejected_without_touching_the_row() {
    let store = Store::open_in_memory().await.unwrap();
    let future = Utc::now() + Duration::hours(6);

    let a = with_polygon(
        alert(1, "B-1", t0(), Some(future), Severity::Minor),
        "0,0 0,10 10,0 10,10",
    );
    let mut stored = store.bulk_insert(vec![a]).await.unwrap().remove(0);

    // Hand the store a bowtie directly, as a buggy writer would.
    stored.info[0].area[0].geo_json = Some(GeoJson::Polygon(vec![vec![
        [0.0, 0.0],
        [10.0, 0.0],
        [0.0, 10.0],
        [10.0, 10.0],
        [0.0, 0.0],
    ]]));
    assert!(store.attach_geometry(&stored).await.is_err());

    // The alert is still there, without geometry, and spatially invisible.
    let reread = store.find_by_identifier("B-1").await.unwrap().unwrap();
    assert!(reread.info[0].area[0].geo_json.is_none());
    assert!(store.find_by_point(5.0, 5.0).await.unwrap().is_empty());
}

#[tokio::test]
async fn mark_expired_flips_and_reports_and_scopes_by_source() {
    let store = Store::open_in_memory().await.unwrap();
    let expires = t0() + Duration::hours(6);

    store
        .bulk_insert(vec![
            {
                let mut a = alert(1, "E-1", t0(), Some(expires), Severity::Minor);
                a.active = true;
                a
            },
            {
                let mut a = alert(2, "E-2", t0(), Some(expires), Severity::Minor);
                a.active = true;
                a
            },
        ])
        .await
        .unwrap();

    let after = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    let flipped = store.mark_expired(after, Some(1)).await.unwrap();
    assert_eq!(flipped.len(), 1);
    assert_eq!(flipped[0].identifier, "E-1");
    assert!(!flipped[0].active);

    // Second pass is a no-op for that source; the other source still flips.
    assert!(store.mark_expired(after, Some(1)).await.unwrap().is_empty());
    assert_eq!(store.mark_expired(after, None).await.unwrap().len(), 1);
    assert!(store.find_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn retention_purges_only_old_inactive_rows() {
    let store = Store::open_in_memory().await.unwrap();
    let now = Utc::now();

    let old = alert(
        1,
        "OLD-1",
        now - Duration::days(45),
        Some(now - Duration::days(44)),
        Severity::Minor,
    );
    let recent = alert(
        1,
        "NEW-1",
        now - Duration::days(2),
        Some(now - Duration::days(1)),
        Severity::Minor,
    );
    let live = alert(1, "LIVE-1", now, Some(now + Duration::hours(6)), Severity::Minor);
    store.bulk_insert(vec![old, recent, live]).await.unwrap();

    let purged = store.delete_old_inactive(now - Duration::days(30)).await.unwrap();
    assert_eq!(purged, 1);
    assert!(store.find_by_identifier("OLD-1").await.unwrap().is_none());
    assert!(store.find_by_identifier("NEW-1").await.unwrap().is_some());
    assert!(store.find_by_identifier("LIVE-1").await.unwrap().is_some());
}

#[tokio::test]
async fn file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_uri = format!("sqlite://{}", dir.path().join("alerts.db").display());

    {
        let store = Store::open(&db_uri).await.unwrap();
        store
            .bulk_insert(vec![alert(
                1,
                "PERSIST-1",
                t0(),
                Some(Utc::now() + Duration::hours(6)),
                Severity::Minor,
            )])
            .await
            .unwrap();
    }

    let reopened = Store::open(&db_uri).await.unwrap();
    let stored = reopened
        .find_by_identifier("PERSIST-1")
        .await
        .unwrap()
        .unwrap();
    assert!(stored.active);
}

#[tokio::test]
async fn severity_filter_and_stats_counts() {
    let store = Store::open_in_memory().await.unwrap();
    let future = Utc::now() + Duration::hours(6);

    store
        .bulk_insert(vec![
            alert(1, "S-1", t0(), Some(future), Severity::Extreme),
            alert(1, "S-2", t0(), Some(future), Severity::Minor),
            alert(1, "S-3", t0(), Some(Utc::now() - Duration::hours(1)), Severity::Extreme),
        ])
        .await
        .unwrap();

    let extreme = store.find_by_severity(Severity::Extreme).await.unwrap();
    assert_eq!(extreme.len(), 1);
    assert_eq!(extreme[0].identifier, "S-1");

    let counts = store.count_stats().await.unwrap();
    assert_eq!(counts.total, 3);
    assert_eq!(counts.active, 2);
    assert_eq!(counts.by_severity.get("Extreme"), Some(&1));
    assert_eq!(counts.by_severity.get("Minor"), Some(&1));
    assert_eq!(counts.by_category.get("Met"), Some(&2));
}
