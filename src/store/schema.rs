/// Schema for the record cache.
pub const SCHEMA: &str = r#"
-- One row per record id. Deleted records keep a tombstone row so that
-- local revisions keep increasing if the id is ever written again.
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    region TEXT NOT NULL,
    payload TEXT NOT NULL,
    version INTEGER NOT NULL,
    local_revision INTEGER NOT NULL,
    modified_at TEXT NOT NULL,
    last_synced_at TEXT,
    dirty INTEGER NOT NULL DEFAULT 0,
    push_token TEXT,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_records_region ON records(region, deleted);
CREATE INDEX IF NOT EXISTS idx_records_dirty ON records(dirty, deleted);

-- High-water version marker per region for incremental fetches
CREATE TABLE IF NOT EXISTS region_sync (
    region TEXT PRIMARY KEY,
    max_version INTEGER NOT NULL,
    last_synced_at TEXT NOT NULL
);
"#;
