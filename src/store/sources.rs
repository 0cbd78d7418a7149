//! Source registry operations.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use super::{fmt_ts, parse_ts, Store};
use crate::model::{NewSource, Source, SourceUpdate, MIN_FETCH_INTERVAL_SECS};

const SOURCE_COLUMNS: &str = "id, name, url, country, language, active, is_default, \
     fetch_interval_secs, total_fetches, successful_fetches, failed_fetches, \
     last_fetched_at, last_successful_fetch_at, last_error, metadata, created_at, updated_at";

fn source_from_row(row: &Row) -> rusqlite::Result<Source> {
    let metadata: String = row.get(14)?;
    let created_at: String = row.get(15)?;
    let updated_at: String = row.get(16)?;
    Ok(Source {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        country: row.get(3)?,
        language: row.get(4)?,
        active: row.get::<_, i64>(5)? != 0,
        is_default: row.get::<_, i64>(6)? != 0,
        fetch_interval_secs: row.get::<_, i64>(7)?.max(0) as u32,
        total_fetches: row.get::<_, i64>(8)?.max(0) as u64,
        successful_fetches: row.get::<_, i64>(9)?.max(0) as u64,
        failed_fetches: row.get::<_, i64>(10)?.max(0) as u64,
        last_fetched_at: row
            .get::<_, Option<String>>(11)?
            .as_deref()
            .and_then(parse_ts),
        last_successful_fetch_at: row
            .get::<_, Option<String>>(12)?
            .as_deref()
            .and_then(parse_ts),
        last_error: row.get(13)?,
        metadata: serde_json::from_str(&metadata)
            .unwrap_or_else(|_| Value::Object(serde_json::Map::new())),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_ts(&updated_at).unwrap_or_else(Utc::now),
    })
}

impl Store {
    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        let sources = self
            .conn()
            .call(|conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY name"))?;
                let rows = stmt
                    .query_map([], source_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(sources)
    }

    pub async fn get_active_sources(&self) -> Result<Vec<Source>> {
        let sources = self
            .conn()
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SOURCE_COLUMNS} FROM sources WHERE active = 1 ORDER BY name"
                ))?;
                let rows = stmt
                    .query_map([], source_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(sources)
    }

    pub async fn get_default_source(&self) -> Result<Option<Source>> {
        let source = self
            .conn()
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SOURCE_COLUMNS} FROM sources WHERE is_default = 1 LIMIT 1"
                ))?;
                let row = stmt.query_row([], source_from_row).optional()?;
                Ok(row)
            })
            .await?;
        Ok(source)
    }

    pub async fn get_source(&self, id: i64) -> Result<Option<Source>> {
        let source = self
            .conn()
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?1"))?;
                let row = stmt.query_row(params![id], source_from_row).optional()?;
                Ok(row)
            })
            .await?;
        Ok(source)
    }

    pub async fn get_source_by_name(&self, name: &str) -> Result<Option<Source>> {
        let name = name.to_string();
        let source = self
            .conn()
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE name = ?1"))?;
                let row = stmt.query_row(params![name], source_from_row).optional()?;
                Ok(row)
            })
            .await?;
        Ok(source)
    }

    /// Create a source. Setting `is_default` clears the flag on every other
    /// row in the same transaction, so at most one default ever exists.
    pub async fn create_source(&self, new: NewSource) -> Result<Source> {
        if self.get_source_by_name(&new.name).await?.is_some() {
            bail!("source name '{}' already exists", new.name);
        }
        let now = fmt_ts(Utc::now());
        let interval = new.fetch_interval_secs.max(MIN_FETCH_INTERVAL_SECS);
        let metadata =
            serde_json::to_string(&new.metadata).context("serializing source metadata")?;

        let id = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                if new.is_default {
                    tx.execute(
                        "UPDATE sources SET is_default = 0, updated_at = ?1 WHERE is_default = 1",
                        params![now],
                    )?;
                }
                tx.execute(
                    "INSERT INTO sources (name, url, country, language, active, is_default, \
                     fetch_interval_secs, metadata, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        new.name,
                        new.url,
                        new.country,
                        new.language,
                        new.active as i64,
                        new.is_default as i64,
                        i64::from(interval),
                        metadata,
                        now,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(id)
            })
            .await?;

        self.get_source(id)
            .await?
            .context("source missing after insert")
    }

    /// Apply a partial update. Returns `None` when the source does not exist.
    pub async fn update_source(&self, id: i64, patch: SourceUpdate) -> Result<Option<Source>> {
        let Some(current) = self.get_source(id).await? else {
            return Ok(None);
        };
        if let Some(name) = &patch.name {
            if name != &current.name && self.get_source_by_name(name).await?.is_some() {
                bail!("source name '{name}' already exists");
            }
        }

        let name = patch.name.unwrap_or(current.name);
        let url = patch.url.unwrap_or(current.url);
        let country = patch.country.or(current.country);
        let language = patch.language.or(current.language);
        let active = patch.active.unwrap_or(current.active);
        let is_default = patch.is_default.unwrap_or(current.is_default);
        let interval = patch
            .fetch_interval_secs
            .unwrap_or(current.fetch_interval_secs)
            .max(MIN_FETCH_INTERVAL_SECS);
        let metadata = serde_json::to_string(&patch.metadata.unwrap_or(current.metadata))
            .context("serializing source metadata")?;
        let now = fmt_ts(Utc::now());

        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                if is_default {
                    tx.execute(
                        "UPDATE sources SET is_default = 0, updated_at = ?1 \
                         WHERE is_default = 1 AND id != ?2",
                        params![now, id],
                    )?;
                }
                tx.execute(
                    "UPDATE sources SET name = ?1, url = ?2, country = ?3, language = ?4, \
                     active = ?5, is_default = ?6, fetch_interval_secs = ?7, metadata = ?8, \
                     updated_at = ?9 WHERE id = ?10",
                    params![
                        name,
                        url,
                        country,
                        language,
                        active as i64,
                        is_default as i64,
                        i64::from(interval),
                        metadata,
                        now,
                        id,
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        self.get_source(id).await
    }

    /// Delete a source. The default source cannot be deleted; alerts already
    /// ingested from the source are kept.
    pub async fn delete_source(&self, id: i64) -> Result<Option<Source>> {
        let Some(source) = self.get_source(id).await? else {
            return Ok(None);
        };
        if source.is_default {
            bail!("cannot delete the default source '{}'", source.name);
        }
        self.conn()
            .call(move |conn| {
                conn.execute("DELETE FROM sources WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        Ok(Some(source))
    }

    /// Bump fetch counters and timestamps after a cycle, in both outcomes.
    pub async fn record_fetch_attempt(
        &self,
        id: i64,
        success: bool,
        error: Option<String>,
    ) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let last_error = if success { None } else { error };
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "UPDATE sources SET \
                     total_fetches = total_fetches + 1, \
                     successful_fetches = successful_fetches + ?1, \
                     failed_fetches = failed_fetches + ?2, \
                     last_fetched_at = ?3, \
                     last_successful_fetch_at = CASE WHEN ?1 = 1 THEN ?3 \
                         ELSE last_successful_fetch_at END, \
                     last_error = ?4, \
                     updated_at = ?3 \
                     WHERE id = ?5",
                    params![success as i64, (!success) as i64, now, last_error, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Install the built-in publisher set. A no-op unless the table is empty.
    pub async fn seed_default_sources(&self) -> Result<Vec<Source>> {
        let existing: i64 = self
            .conn()
            .call(|conn| {
                let n = conn.query_row("SELECT COUNT(*) FROM sources", [], |r| r.get(0))?;
                Ok(n)
            })
            .await?;
        if existing > 0 {
            return Ok(Vec::new());
        }
        let mut created = Vec::new();
        for new in default_sources() {
            created.push(self.create_source(new).await?);
        }
        Ok(created)
    }
}

/// The upstream publishers this pipeline was built against.
fn default_sources() -> Vec<NewSource> {
    vec![NewSource {
        name: "NDMA Sachet (India)".to_string(),
        url: "https://sachet.ndma.gov.in/cap_public_website/rss/rss_india.xml".to_string(),
        country: Some("IN".to_string()),
        language: Some("en-IN".to_string()),
        active: true,
        is_default: true,
        fetch_interval_secs: 60,
        metadata: serde_json::json!({
            "detailUrl": "https://sachet.ndma.gov.in/cap_public_website/FetchXMLFile?identifier=",
            "htmlUrl": "https://sachet.ndma.gov.in/cap_public_website/FetchCAPDetails?identifier=",
        }),
    }]
}
