// tests/geometry_rings.rs
//
// Polygon string decoding and ring validation: closure, ordering, range
// filtering, self-intersection rejection, multi-ring assembly.

use cap_relay::geometry::{
    decode_polygon_ring, normalize_area, parse_polygon_points, point_in_geometry, ring_is_valid,
    GeoJson,
};

#[test]
fn cap_polygon_becomes_lon_lat_ring_with_closure() {
    // "lat,lon ..." in, [lon, lat] out, closed by duplicating the first point.
    let ring = decode_polygon_ring("10,20 10,30 20,30 20,20").expect("valid ring");
    assert_eq!(
        ring,
        vec![
            [20.0, 10.0],
            [30.0, 10.0],
            [30.0, 20.0],
            [20.0, 20.0],
            [20.0, 10.0],
        ]
    );
}

#[test]
fn already_closed_input_is_not_double_closed() {
    let ring = decode_polygon_ring("10,20 10,30 20,30 10,20").expect("valid ring");
    assert_eq!(ring.len(), 4);
    assert_eq!(ring.first(), ring.last());
}

#[test]
fn space_separated_coordinates_decode_identically() {
    let comma = decode_polygon_ring("10,20 10,30 20,30 20,20").unwrap();
    let spaced = decode_polygon_ring("10 20 10 30 20 30 20 20").unwrap();
    assert_eq!(comma, spaced);
}

#[test]
fn vertices_round_trip_modulo_closure() {
    let raw = "10,20 10,30 20,30 20,20";
    let ring = decode_polygon_ring(raw).unwrap();
    // Re-serialize as "lat,lon" and compare to the original vertex list.
    let back: Vec<String> = ring[..ring.len() - 1]
        .iter()
        .map(|p| format!("{},{}", p[1], p[0]))
        .collect();
    assert_eq!(back.join(" "), raw);
}

#[test]
fn out_of_range_and_non_finite_points_are_dropped() {
    let pts = parse_polygon_points("10,20 95,30 -95,10 10,181 10,-181 nan,5 20,20");
    assert_eq!(pts, vec![[20.0, 10.0], [20.0, 20.0]]);
}

#[test]
fn fewer_than_three_unique_points_is_no_ring() {
    assert!(decode_polygon_ring("10,20 10,30").is_none());
    assert!(decode_polygon_ring("10,20 10,20 10,20 10,20").is_none());
    assert!(decode_polygon_ring("").is_none());
}

#[test]
fn bowtie_fails_validation_and_reversal_repair() {
    // Edges (0,0)-(10,0) x (0,10)-(10,10) in lon/lat order cross.
    assert!(decode_polygon_ring("0,0 0,10 10,0 10,10").is_none());
}

#[test]
fn collinear_overlap_counts_as_self_intersection() {
    // Spike: the ring doubles back along one edge.
    let ring = vec![
        [0.0, 0.0],
        [10.0, 0.0],
        [5.0, 0.0],
        [5.0, 5.0],
        [0.0, 0.0],
    ];
    assert!(!ring_is_valid(&ring));
}

#[test]
fn normalize_area_builds_polygon_and_multipolygon() {
    let one = normalize_area(&["10,20 10,30 20,30 20,20".into()], &[]).unwrap();
    assert!(matches!(one, GeoJson::Polygon(_)));

    let two = normalize_area(
        &[
            "10,20 10,30 20,30 20,20".into(),
            "40,50 40,60 50,60 50,50".into(),
        ],
        &[],
    )
    .unwrap();
    match two {
        GeoJson::MultiPolygon(polys) => assert_eq!(polys.len(), 2),
        other => panic!("expected MultiPolygon, got {other:?}"),
    }
}

#[test]
fn invalid_rings_are_dropped_individually() {
    // One bowtie plus one valid square: the square survives alone.
    let geo = normalize_area(
        &[
            "0,0 0,10 10,0 10,10".into(),
            "10,20 10,30 20,30 20,20".into(),
        ],
        &[],
    )
    .unwrap();
    assert!(matches!(geo, GeoJson::Polygon(_)));

    // Only invalid input: no geometry at all.
    assert!(normalize_area(&["0,0 0,10 10,0 10,10".into()], &[]).is_none());
}

#[test]
fn point_in_polygon_agrees_with_the_original_shape() {
    // Triangle (lat,lon): (0,0) (0,10) (10,10) -> interior has lat < lon.
    let geo = normalize_area(&["0,0 0,10 10,10".into()], &[]).unwrap();
    assert!(point_in_geometry(&geo, 8.0, 2.0));
    assert!(!point_in_geometry(&geo, 2.0, 8.0));
    // Far outside the bounding box too.
    assert!(!point_in_geometry(&geo, 50.0, 50.0));
}

#[test]
fn geojson_serializes_with_type_tag() {
    let geo = normalize_area(&["10,20 10,30 20,30 20,20".into()], &[]).unwrap();
    let v = serde_json::to_value(&geo).unwrap();
    assert_eq!(v["type"], "Polygon");
    assert_eq!(v["coordinates"][0][0][0], 20.0);
    assert_eq!(v["coordinates"][0][0][1], 10.0);
}
