//! Alert store operations.
//!
//! Each alert row carries the canonical record as JSON plus denormalized
//! query columns; `alert_extents` (R*Tree) holds one bounding box per alert
//! with valid geometry. Point queries narrow candidates through the R*Tree
//! and then run exact point-in-polygon against the stored GeoJSON.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{fmt_ts, parse_ts, Store};
use crate::geometry;
use crate::model::{max_expires, top_severity, Alert, Severity};

/// Slim view of a stored alert used by the reconciliation diff.
#[derive(Debug, Clone)]
pub struct ExistingAlert {
    pub id: i64,
    pub sent: DateTime<Utc>,
    pub active: bool,
}

/// Aggregate counts for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertCounts {
    pub total: u64,
    pub active: u64,
    pub by_severity: HashMap<String, u64>,
    pub by_category: HashMap<String, u64>,
}

/// Serialize the record without its row id; ids live in the id column and
/// are injected back on load.
fn payload_json(alert: &Alert) -> Result<String> {
    let mut flat = alert.clone();
    flat.id = None;
    serde_json::to_string(&flat).context("serializing alert payload")
}

fn decode_payload(id: i64, payload: &str) -> Option<Alert> {
    match serde_json::from_str::<Alert>(payload) {
        Ok(mut alert) => {
            alert.id = Some(id);
            Some(alert)
        }
        Err(e) => {
            tracing::warn!(alert_id = id, error = %e, "undecodable alert payload");
            None
        }
    }
}

impl Store {
    /// Insert a batch of new alerts in one transaction, returning them with
    /// assigned row ids.
    pub async fn bulk_insert(&self, mut alerts: Vec<Alert>) -> Result<Vec<Alert>> {
        if alerts.is_empty() {
            return Ok(alerts);
        }
        let mut rows = Vec::with_capacity(alerts.len());
        for alert in &alerts {
            rows.push((
                alert.source_id,
                alert.identifier.clone(),
                fmt_ts(alert.sent),
                alert.active as i64,
                top_severity(alert).rank(),
                max_expires(alert).map(fmt_ts),
                fmt_ts(alert.fetched_at),
                payload_json(alert)?,
                fmt_ts(alert.created_at),
                fmt_ts(alert.updated_at),
            ));
        }

        let ids = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut ids = Vec::with_capacity(rows.len());
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO alerts (source_id, identifier, sent, active, \
                         severity_rank, max_expires, fetched_at, payload, created_at, \
                         updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    )?;
                    for r in &rows {
                        stmt.execute(params![
                            r.0, r.1, r.2, r.3, r.4, r.5, r.6, r.7, r.8, r.9
                        ])?;
                        ids.push(tx.last_insert_rowid());
                    }
                }
                tx.commit()?;
                Ok(ids)
            })
            .await?;

        for (alert, id) in alerts.iter_mut().zip(ids) {
            alert.id = Some(id);
        }
        Ok(alerts)
    }

    /// Rewrite existing rows (matched on `(source_id, identifier)`) with a
    /// fresh payload and recomputed query columns, in one transaction.
    /// `created_at` is preserved. Returns the number of rows touched.
    /// Borrows the batch: callers keep it for geometry attach and event
    /// emission after the write.
    pub async fn bulk_upsert(&self, alerts: &[Alert]) -> Result<usize> {
        if alerts.is_empty() {
            return Ok(0);
        }
        let mut rows = Vec::with_capacity(alerts.len());
        for alert in alerts {
            rows.push((
                fmt_ts(alert.sent),
                alert.active as i64,
                top_severity(alert).rank(),
                max_expires(alert).map(fmt_ts),
                fmt_ts(alert.fetched_at),
                payload_json(alert)?,
                fmt_ts(alert.updated_at),
                alert.source_id,
                alert.identifier.clone(),
            ));
        }

        let touched = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut touched = 0usize;
                {
                    let mut stmt = tx.prepare(
                        "UPDATE alerts SET sent = ?1, active = ?2, severity_rank = ?3, \
                         max_expires = ?4, fetched_at = ?5, payload = ?6, updated_at = ?7 \
                         WHERE source_id = ?8 AND identifier = ?9",
                    )?;
                    for r in &rows {
                        touched += stmt
                            .execute(params![r.0, r.1, r.2, r.3, r.4, r.5, r.6, r.7, r.8])?;
                    }
                }
                tx.commit()?;
                Ok(touched)
            })
            .await?;
        Ok(touched)
    }

    /// Diff support: the stored `(id, sent, active)` for each identifier the
    /// parser just returned.
    pub async fn find_by_identifiers(
        &self,
        source_id: i64,
        identifiers: &[String],
    ) -> Result<HashMap<String, ExistingAlert>> {
        if identifiers.is_empty() {
            return Ok(HashMap::new());
        }
        let idents = identifiers.to_vec();
        let raw = self
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, sent, active FROM alerts \
                     WHERE source_id = ?1 AND identifier = ?2",
                )?;
                let mut out = Vec::new();
                for ident in idents {
                    let row = stmt
                        .query_row(params![source_id, ident], |r| {
                            Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
                        })
                        .optional()?;
                    if let Some((id, sent, active)) = row {
                        out.push((ident, id, sent, active != 0));
                    }
                }
                Ok(out)
            })
            .await?;

        let mut map = HashMap::with_capacity(raw.len());
        for (ident, id, sent, active) in raw {
            let Some(sent) = parse_ts(&sent) else {
                tracing::warn!(alert_id = id, "unparseable sent column");
                continue;
            };
            map.insert(ident, ExistingAlert { id, sent, active });
        }
        Ok(map)
    }

    /// Persist derived geometry for an already-stored alert and index its
    /// bounding box. Rings are re-validated here: topologically invalid
    /// geometry is rejected without touching the row, mirroring a spatial
    /// index refusing the write.
    pub async fn attach_geometry(&self, alert: &Alert) -> Result<()> {
        let id = alert.id.context("attach_geometry needs a stored alert")?;

        let mut bbox: Option<(f64, f64, f64, f64)> = None;
        for info in &alert.info {
            for area in &info.area {
                if let Some(geo) = &area.geo_json {
                    if !geometry::geojson_is_valid(geo) {
                        // Unreachable from the scheduler, whose normalizer
                        // drops invalid rings before geo_json is ever set;
                        // this guards the index against any other writer.
                        bail!("invalid geometry for alert {}", alert.identifier);
                    }
                    let b = geometry::bounding_box(geo);
                    bbox = Some(match bbox {
                        Some(prev) => geometry::merge_bbox(prev, b),
                        None => b,
                    });
                }
            }
        }
        let payload = payload_json(alert)?;
        let updated_at = fmt_ts(Utc::now());

        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE alerts SET payload = ?1, updated_at = ?2 WHERE id = ?3",
                    params![payload, updated_at, id],
                )?;
                tx.execute("DELETE FROM alert_extents WHERE id = ?1", params![id])?;
                if let Some((min_lon, min_lat, max_lon, max_lat)) = bbox {
                    tx.execute(
                        "INSERT INTO alert_extents (id, min_lon, max_lon, min_lat, max_lat) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![id, min_lon, max_lon, min_lat, max_lat],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Active alerts, most severe first, most recent first within a severity.
    pub async fn find_active(&self) -> Result<Vec<Alert>> {
        let rows = self
            .conn()
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, payload FROM alerts WHERE active = 1 \
                     ORDER BY severity_rank DESC, sent DESC",
                )?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, payload)| decode_payload(id, &payload))
            .collect())
    }

    /// Look up one alert by its publisher identifier (any source, newest
    /// `sent` wins on the defensive cross-source collision).
    pub async fn find_by_identifier(&self, identifier: &str) -> Result<Option<Alert>> {
        let ident = identifier.to_string();
        let row = self
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, payload FROM alerts WHERE identifier = ?1 \
                     ORDER BY sent DESC LIMIT 1",
                )?;
                let row = stmt
                    .query_row(params![ident], |r| {
                        Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
                    })
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(row.and_then(|(id, payload)| decode_payload(id, &payload)))
    }

    /// Active alerts where any info block matches the given severity.
    pub async fn find_by_severity(&self, severity: Severity) -> Result<Vec<Alert>> {
        let all = self.find_active().await?;
        Ok(all
            .into_iter()
            .filter(|a| a.info.iter().any(|i| i.severity == severity))
            .collect())
    }

    /// Point-in-area lookup among active alerts: R*Tree bounding boxes first,
    /// exact ray casting second.
    pub async fn find_by_point(&self, lon: f64, lat: f64) -> Result<Vec<Alert>> {
        let rows = self
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.id, a.payload FROM alerts a \
                     JOIN alert_extents e ON e.id = a.id \
                     WHERE a.active = 1 \
                       AND e.min_lon <= ?1 AND e.max_lon >= ?1 \
                       AND e.min_lat <= ?2 AND e.max_lat >= ?2 \
                     ORDER BY a.severity_rank DESC, a.sent DESC",
                )?;
                let rows = stmt
                    .query_map(params![lon, lat], |r| {
                        Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, payload)| decode_payload(id, &payload))
            .filter(|alert| {
                alert.info.iter().any(|i| {
                    i.area.iter().any(|area| {
                        area.geo_json
                            .as_ref()
                            .map(|g| geometry::point_in_geometry(g, lon, lat))
                            .unwrap_or(false)
                    })
                })
            })
            .collect())
    }

    /// Flip the active bit on every alert whose last expiry has passed,
    /// optionally scoped to one source. Returns the flipped records so the
    /// caller can emit expire events.
    pub async fn mark_expired(
        &self,
        now: DateTime<Utc>,
        source_id: Option<i64>,
    ) -> Result<Vec<Alert>> {
        let now_s = fmt_ts(now);
        let flipped = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut flipped = Vec::new();
                {
                    let mut stmt = tx.prepare(
                        "SELECT id, payload FROM alerts \
                         WHERE active = 1 \
                           AND (max_expires IS NULL OR max_expires <= ?1) \
                           AND (?2 IS NULL OR source_id = ?2)",
                    )?;
                    let rows = stmt
                        .query_map(params![now_s, source_id], |r| {
                            Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;

                    let mut update = tx.prepare(
                        "UPDATE alerts SET active = 0, payload = ?1, updated_at = ?2 \
                         WHERE id = ?3",
                    )?;
                    let mut flag_only = tx.prepare(
                        "UPDATE alerts SET active = 0, updated_at = ?1 WHERE id = ?2",
                    )?;
                    for (id, payload) in rows {
                        match decode_payload(id, &payload) {
                            Some(mut alert) => {
                                alert.active = false;
                                let fresh = serde_json::to_string(&Alert {
                                    id: None,
                                    ..alert.clone()
                                });
                                match fresh {
                                    Ok(json) => {
                                        update.execute(params![json, now_s, id])?;
                                        flipped.push(alert);
                                    }
                                    Err(_) => {
                                        flag_only.execute(params![now_s, id])?;
                                    }
                                }
                            }
                            None => {
                                // Row is unreadable; still repair the bit.
                                flag_only.execute(params![now_s, id])?;
                            }
                        }
                    }
                }
                tx.commit()?;
                Ok(flipped)
            })
            .await?;
        Ok(flipped)
    }

    /// Purge inactive alerts whose last expiry and fetch are both older than
    /// the cutoff. Extents go with them. Returns the number deleted.
    pub async fn delete_old_inactive(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff_s = fmt_ts(cutoff);
        let deleted = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM alert_extents WHERE id IN ( \
                         SELECT id FROM alerts WHERE active = 0 \
                         AND (max_expires IS NULL OR max_expires < ?1) \
                         AND fetched_at < ?1)",
                    params![cutoff_s],
                )?;
                let n = tx.execute(
                    "DELETE FROM alerts WHERE active = 0 \
                     AND (max_expires IS NULL OR max_expires < ?1) \
                     AND fetched_at < ?1",
                    params![cutoff_s],
                )?;
                tx.commit()?;
                Ok(n)
            })
            .await?;
        Ok(deleted)
    }

    /// Counts for the stats endpoint. Severity and category tallies cover
    /// active alerts only.
    pub async fn count_stats(&self) -> Result<AlertCounts> {
        let (total, active) = self
            .conn()
            .call(|conn| {
                let total: i64 =
                    conn.query_row("SELECT COUNT(*) FROM alerts", [], |r| r.get(0))?;
                let active: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM alerts WHERE active = 1",
                    [],
                    |r| r.get(0),
                )?;
                Ok((total, active))
            })
            .await?;

        let mut by_severity: HashMap<String, u64> = HashMap::new();
        let mut by_category: HashMap<String, u64> = HashMap::new();
        for alert in self.find_active().await? {
            for info in &alert.info {
                *by_severity
                    .entry(info.severity.as_str().to_string())
                    .or_default() += 1;
                for cat in &info.category {
                    *by_category.entry(cat.clone()).or_default() += 1;
                }
            }
        }

        Ok(AlertCounts {
            total: total.max(0) as u64,
            active: active.max(0) as u64,
            by_severity,
            by_category,
        })
    }
}
