pub const SCHEMA: &str = r#"
-- upstream publisher registry
CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL,
    country TEXT,
    language TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    is_default INTEGER NOT NULL DEFAULT 0,
    fetch_interval_secs INTEGER NOT NULL DEFAULT 300,
    total_fetches INTEGER NOT NULL DEFAULT 0,
    successful_fetches INTEGER NOT NULL DEFAULT 0,
    failed_fetches INTEGER NOT NULL DEFAULT 0,
    last_fetched_at TEXT,
    last_successful_fetch_at TEXT,
    last_error TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- canonical alerts; the full record lives in payload, query columns are
-- denormalized from it at write time
CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL,
    identifier TEXT NOT NULL,
    sent TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 0,
    severity_rank INTEGER NOT NULL DEFAULT 0,
    max_expires TEXT,
    fetched_at TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(source_id, identifier)
);

CREATE INDEX IF NOT EXISTS idx_alerts_active ON alerts(active);
CREATE INDEX IF NOT EXISTS idx_alerts_severity ON alerts(severity_rank DESC);
CREATE INDEX IF NOT EXISTS idx_alerts_expires ON alerts(max_expires);

-- one bounding box per alert with valid geometry; exact point-in-polygon
-- runs against the payload after the R*Tree narrows candidates
CREATE VIRTUAL TABLE IF NOT EXISTS alert_extents USING rtree(
    id,
    min_lon, max_lon,
    min_lat, max_lat
);
"#;
