//! SQLite persistence.
//!
//! A single `tokio-rusqlite` connection; every operation is a closure run on
//! the connection's worker thread, so store calls are suspension points for
//! the async callers. Bulk operations run inside one transaction.

pub mod alerts;
pub mod schema;
pub mod sources;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_rusqlite::Connection;

use schema::SCHEMA;

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (and migrate) the database named by `DB_URI`. Accepts a plain
    /// path, a `sqlite://` prefix, or `:memory:`.
    pub async fn open(db_uri: &str) -> Result<Self> {
        let path = db_uri.strip_prefix("sqlite://").unwrap_or(db_uri);
        let conn = if path == ":memory:" {
            Connection::open_in_memory().await
        } else {
            Connection::open(path).await
        }
        .with_context(|| format!("opening database at {path}"))?;

        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .context("applying schema")?;

        Ok(Self { conn })
    }

    /// In-memory store, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Fixed-width RFC 3339 UTC, so string comparison agrees with time order.
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_format_round_trips_and_sorts() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        assert_eq!(parse_ts(&fmt_ts(a)), Some(a));
        assert!(fmt_ts(a) < fmt_ts(b));
    }
}
