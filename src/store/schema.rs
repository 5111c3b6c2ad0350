//! Idempotent schema migrations for the embedded SQL engine (spec §4.A
//! step 4, §6 "Persisted state layout"). Every statement is
//! `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT EXISTS` so applying
//! them twice is a no-op, matching the grounding file's `init_schema`.

use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

/// Apply all core tables and indices. Safe to call on every `initialize()`.
pub fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    email TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_sync_at TEXT,
    origin_device TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS issues (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL CHECK(length(title) > 0),
    description TEXT,
    status TEXT NOT NULL CHECK(status IN ('pending','in_progress','completed','cancelled')),
    priority TEXT NOT NULL CHECK(priority IN ('low','medium','high','urgent')),
    assignee TEXT,
    session_id TEXT,
    task_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    locally_modified INTEGER NOT NULL DEFAULT 1,
    deleted_at TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    device_id TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status);
CREATE INDEX IF NOT EXISTS idx_issues_assignee ON issues(assignee);
CREATE INDEX IF NOT EXISTS idx_issues_session_id ON issues(session_id);
CREATE INDEX IF NOT EXISTS idx_issues_updated_at ON issues(updated_at DESC);

CREATE TABLE IF NOT EXISTS sync_queue (
    change_id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    row_id TEXT NOT NULL,
    operation TEXT NOT NULL CHECK(operation IN ('CREATE','UPDATE','DELETE')),
    payload TEXT NOT NULL,
    device_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    synced_at TEXT,
    retries INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_retry_at TEXT
);

-- At most one unsynced row per (table_name, row_id): spec §3 invariant,
-- enforced at the SQL layer rather than merely by application discipline.
CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_queue_unsynced_unique
    ON sync_queue(table_name, row_id)
    WHERE synced_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_sync_queue_synced_at ON sync_queue(synced_at);

CREATE TABLE IF NOT EXISTS sync_conflicts (
    conflict_id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    row_id TEXT NOT NULL,
    local_data TEXT NOT NULL,
    remote_data TEXT NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('UPDATE_UPDATE','UPDATE_DELETE','CREATE_CREATE','DELETE_DELETE')),
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    resolution TEXT CHECK(resolution IS NULL OR resolution IN ('LOCAL_WINS','REMOTE_WINS','MERGED','USER_DECISION'))
);

CREATE TABLE IF NOT EXISTS sync_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('push','pull','full_sync','conflict')),
    latency_ms INTEGER NOT NULL,
    record_count INTEGER NOT NULL,
    bytes_transferred INTEGER NOT NULL,
    success INTEGER NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_metrics_created_at ON sync_metrics(created_at DESC);

CREATE TABLE IF NOT EXISTS performance_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    family TEXT NOT NULL,
    operation TEXT NOT NULL,
    value REAL NOT NULL,
    percentile TEXT,
    created_at TEXT NOT NULL,
    device_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS health_checks (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    written_at TEXT NOT NULL,
    ttl_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_written_at ON cache_entries(written_at);

CREATE TABLE IF NOT EXISTS backups (
    backup_id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    version_tag TEXT NOT NULL,
    byte_size INTEGER NOT NULL,
    compressed INTEGER NOT NULL DEFAULT 0,
    snapshot BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backups_created_at ON backups(created_at DESC);
"#,
    )?;

    conn.execute(
        "INSERT INTO health_checks(key, value, updated_at) VALUES ('schema_version', ?1, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}
