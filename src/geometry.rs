//! # Geometry Normalizer
//! Pure, testable conversion of CAP polygon/circle strings into validated
//! GeoJSON. No I/O and no panics: every failure path returns `None` and the
//! caller stores the alert without geometry.
//!
//! Spatial indexes reject self-intersecting rings, so every ring produced
//! here — decoded or tessellated — passes the same validation before it is
//! allowed out of this module.

use serde::{Deserialize, Serialize};

/// WGS-84 equatorial radius in meters, used for circle tessellation.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Number of bearings when tessellating a circle into a ring.
const CIRCLE_SEGMENTS: usize = 64;

/// Geometry in GeoJSON encoding: coordinates are `[lon, lat]`, rings are
/// closed. Serializes to `{"type": "...", "coordinates": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum GeoJson {
    Polygon(Vec<Vec<[f64; 2]>>),
    MultiPolygon(Vec<Vec<Vec<[f64; 2]>>>),
}

/// Normalize one CAP area's raw geometry strings. Each polygon string and
/// each circle string contributes at most one ring; invalid rings are
/// dropped individually. One surviving ring yields a `Polygon`, several
/// yield a `MultiPolygon`.
pub fn normalize_area(polygons: &[String], circles: &[String]) -> Option<GeoJson> {
    let mut rings: Vec<Vec<[f64; 2]>> = Vec::new();

    for raw in polygons {
        match decode_polygon_ring(raw) {
            Some(ring) => rings.push(ring),
            None => {
                tracing::warn!(polygon = raw.as_str(), "dropping invalid polygon ring");
            }
        }
    }

    for raw in circles {
        match decode_circle_ring(raw) {
            Some(ring) => rings.push(ring),
            None => {
                tracing::warn!(circle = raw.as_str(), "dropping invalid circle");
            }
        }
    }

    match rings.len() {
        0 => None,
        1 => Some(GeoJson::Polygon(vec![rings.remove(0)])),
        _ => Some(GeoJson::MultiPolygon(
            rings.into_iter().map(|r| vec![r]).collect(),
        )),
    }
}

/// Decode a CAP polygon string into a closed, validated ring, attempting
/// winding-order repair on self-intersection.
pub fn decode_polygon_ring(raw: &str) -> Option<Vec<[f64; 2]>> {
    let ring = close_ring(parse_polygon_points(raw))?;
    validate_or_repair(ring)
}

/// Decode a CAP circle string into a closed, validated ring.
pub fn decode_circle_ring(raw: &str) -> Option<Vec<[f64; 2]>> {
    let (lat, lon, radius_km) = parse_circle(raw)?;
    let ring = tessellate_circle(lat, lon, radius_km);
    // A well-formed tessellation is always valid; validate anyway so a
    // degenerate radius cannot smuggle a bad ring into the index.
    if ring_is_valid(&ring) {
        Some(ring)
    } else {
        None
    }
}

/// Parse whitespace-separated `"lat,lon"` pairs into `[lon, lat]` points.
/// Some feeds space-separate lat and lon, so both separators are treated as
/// delimiters and scalars are re-paired in order. Points with non-finite or
/// out-of-range coordinates are dropped.
pub fn parse_polygon_points(raw: &str) -> Vec<[f64; 2]> {
    let scalars: Vec<f64> = raw
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .filter_map(|t| t.parse::<f64>().ok())
        .collect();

    scalars
        .chunks_exact(2)
        .filter_map(|pair| {
            let (lat, lon) = (pair[0], pair[1]);
            if coords_in_range(lat, lon) {
                Some([lon, lat])
            } else {
                None
            }
        })
        .collect()
}

/// Parse a CAP circle string `"lat,lon radiusKm"` (separator-tolerant).
pub fn parse_circle(raw: &str) -> Option<(f64, f64, f64)> {
    let scalars: Vec<f64> = raw
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .filter_map(|t| t.parse::<f64>().ok())
        .collect();
    if scalars.len() != 3 {
        return None;
    }
    let (lat, lon, radius_km) = (scalars[0], scalars[1], scalars[2]);
    if !coords_in_range(lat, lon) || !radius_km.is_finite() || radius_km <= 0.0 {
        return None;
    }
    Some((lat, lon, radius_km))
}

fn coords_in_range(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// Drop consecutive duplicates, require at least 3 unique vertices, and
/// close the ring by duplicating the first point when needed.
fn close_ring(points: Vec<[f64; 2]>) -> Option<Vec<[f64; 2]>> {
    let mut ring: Vec<[f64; 2]> = Vec::with_capacity(points.len() + 1);
    for p in points {
        if ring.last() != Some(&p) {
            ring.push(p);
        }
    }
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    if ring.len() < 3 {
        return None;
    }
    let first = ring[0];
    ring.push(first);
    Some(ring)
}

/// Accept a valid ring as-is; on self-intersection, attempt repair by
/// reversing the winding order, then give up.
fn validate_or_repair(ring: Vec<[f64; 2]>) -> Option<Vec<[f64; 2]>> {
    if ring_is_valid(&ring) {
        return Some(ring);
    }
    let mut reversed = ring;
    reversed.reverse();
    if ring_is_valid(&reversed) {
        tracing::debug!("ring repaired by winding reversal");
        Some(reversed)
    } else {
        None
    }
}

/// A ring is valid when it is closed, has at least 3 unique vertices, and no
/// two non-adjacent edges intersect (collinear overlap counts as an
/// intersection).
pub fn ring_is_valid(ring: &[[f64; 2]]) -> bool {
    let n = ring.len();
    if n < 4 || ring.first() != ring.last() {
        return false;
    }
    let edges = n - 1;
    for i in 0..edges {
        for j in (i + 1)..edges {
            // Adjacent edges share a vertex by construction; the first and
            // last edge are adjacent through the closure point.
            if j == i + 1 || (i == 0 && j == edges - 1) {
                continue;
            }
            if segments_intersect(ring[i], ring[i + 1], ring[j], ring[j + 1]) {
                return false;
            }
        }
    }
    true
}

/// Validate an already-assembled GeoJSON object (used by the store before a
/// spatial-index write).
pub fn geojson_is_valid(geo: &GeoJson) -> bool {
    let ring_ok = |ring: &Vec<[f64; 2]>| {
        ring_is_valid(ring) && ring.iter().all(|p| coords_in_range(p[1], p[0]))
    };
    match geo {
        GeoJson::Polygon(rings) => !rings.is_empty() && rings.iter().all(ring_ok),
        GeoJson::MultiPolygon(polys) => {
            !polys.is_empty() && polys.iter().all(|rings| !rings.is_empty() && rings.iter().all(ring_ok))
        }
    }
}

/// Orientation of the triplet (a, b, c): positive for counter-clockwise,
/// negative for clockwise, zero for collinear.
fn orient(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

fn on_segment(a: [f64; 2], b: [f64; 2], p: [f64; 2]) -> bool {
    p[0] >= a[0].min(b[0])
        && p[0] <= a[0].max(b[0])
        && p[1] >= a[1].min(b[1])
        && p[1] <= a[1].max(b[1])
}

/// Segment intersection via the four-endpoint orientation test, including
/// collinear overlap and endpoint touching.
fn segments_intersect(p1: [f64; 2], p2: [f64; 2], q1: [f64; 2], q2: [f64; 2]) -> bool {
    let d1 = orient(q1, q2, p1);
    let d2 = orient(q1, q2, p2);
    let d3 = orient(p1, p2, q1);
    let d4 = orient(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}

/// Tessellate a circle into a closed ring of `CIRCLE_SEGMENTS` points on
/// equally-spaced bearings around the center, using the great-circle
/// destination formula on the WGS-84 sphere.
fn tessellate_circle(lat_deg: f64, lon_deg: f64, radius_km: f64) -> Vec<[f64; 2]> {
    let d = radius_km * 1000.0 / EARTH_RADIUS_M;
    let lat = lat_deg.to_radians();
    let lon = lon_deg.to_radians();

    let mut ring = Vec::with_capacity(CIRCLE_SEGMENTS + 1);
    for k in 0..CIRCLE_SEGMENTS {
        let bearing = 2.0 * std::f64::consts::PI * (k as f64) / (CIRCLE_SEGMENTS as f64);
        let lat2 = (lat.sin() * d.cos() + lat.cos() * d.sin() * bearing.cos()).asin();
        let lon2 = lon
            + (bearing.sin() * d.sin() * lat.cos()).atan2(d.cos() - lat.sin() * lat2.sin());
        ring.push([normalize_lon(lon2.to_degrees()), lat2.to_degrees()]);
    }
    let first = ring[0];
    ring.push(first);
    ring
}

fn normalize_lon(lon: f64) -> f64 {
    let mut l = (lon + 180.0) % 360.0;
    if l < 0.0 {
        l += 360.0;
    }
    l - 180.0
}

/// Ray-casting point-in-polygon over every polygon of the geometry. Only
/// outer rings exist here (the normalizer never emits holes).
pub fn point_in_geometry(geo: &GeoJson, lon: f64, lat: f64) -> bool {
    match geo {
        GeoJson::Polygon(rings) => rings.first().is_some_and(|r| point_in_ring(r, lon, lat)),
        GeoJson::MultiPolygon(polys) => polys
            .iter()
            .any(|rings| rings.first().is_some_and(|r| point_in_ring(r, lon, lat))),
    }
}

fn point_in_ring(ring: &[[f64; 2]], lon: f64, lat: f64) -> bool {
    let n = ring.len();
    if n < 4 {
        return false;
    }
    let mut inside = false;
    // The ring is closed, so edges run between consecutive vertices.
    for i in 0..n - 1 {
        let [xi, yi] = ring[i];
        let [xj, yj] = ring[i + 1];
        if (yi > lat) != (yj > lat) && lon < (xj - xi) * (lat - yi) / (yj - yi) + xi {
            inside = !inside;
        }
    }
    inside
}

/// Axis-aligned bounding box `(min_lon, min_lat, max_lon, max_lat)` for the
/// store's R*Tree rows.
pub fn bounding_box(geo: &GeoJson) -> (f64, f64, f64, f64) {
    let mut bbox = (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
    let mut extend = |p: &[f64; 2]| {
        bbox.0 = bbox.0.min(p[0]);
        bbox.1 = bbox.1.min(p[1]);
        bbox.2 = bbox.2.max(p[0]);
        bbox.3 = bbox.3.max(p[1]);
    };
    match geo {
        GeoJson::Polygon(rings) => rings.iter().flatten().for_each(&mut extend),
        GeoJson::MultiPolygon(polys) => {
            polys.iter().flatten().flatten().for_each(&mut extend)
        }
    }
    bbox
}

/// Merge two bounding boxes (used when an alert carries several areas).
pub fn merge_bbox(a: (f64, f64, f64, f64), b: (f64, f64, f64, f64)) -> (f64, f64, f64, f64) {
    (a.0.min(b.0), a.1.min(b.1), a.2.max(b.2), a.3.max(b.3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_both_separator_styles() {
        let comma = parse_polygon_points("10,20 10,30 20,30 20,20");
        let spaced = parse_polygon_points("10 20 10 30 20 30 20 20");
        assert_eq!(comma, spaced);
        assert_eq!(comma[0], [20.0, 10.0]); // [lon, lat]
    }

    #[test]
    fn out_of_range_points_are_dropped() {
        let pts = parse_polygon_points("10,20 95,30 10,200 20,20");
        assert_eq!(pts.len(), 2);
    }

    #[test]
    fn bowtie_is_rejected_even_after_reversal() {
        assert!(decode_polygon_ring("0,0 0,10 10,0 10,10").is_none());
    }

    #[test]
    fn square_ring_is_closed_and_valid() {
        let ring = decode_polygon_ring("10,20 10,30 20,30 20,20").unwrap();
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.first(), ring.last());
        assert!(ring_is_valid(&ring));
    }
}
