//! Database schema and migrations.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

/// Version 1 is the base layout, version 2 adds `metric_data.display_value`.
pub const SCHEMA_VERSION: i64 = 2;

/// Run all pending migrations and return the resulting schema version.
pub fn migrate(conn: &Connection) -> Result<i64> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS metrics (
            uid TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            parameters_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS metric_data (
            uid TEXT NOT NULL,
            row_id INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            metric_value REAL NOT NULL,
            raw_anomaly_score REAL,
            anomaly_score REAL,
            PRIMARY KEY (uid, row_id),
            FOREIGN KEY (uid) REFERENCES metrics(uid) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS model_definitions (
            model_id TEXT PRIMARY KEY,
            definition_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS model_checkpoints (
            model_id TEXT PRIMARY KEY,
            snapshot_json TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_metric_data_timestamp ON metric_data(uid, timestamp);",
    )?;

    // Migration: Add 'display_value' to metric_data if missing
    let has_display_value: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('metric_data') WHERE name='display_value'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_display_value == 0 {
        conn.execute("ALTER TABLE metric_data ADD COLUMN display_value INTEGER", [])?;
    }

    for version in 1..=SCHEMA_VERSION {
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![version],
        )?;
    }

    current_version(conn)?.ok_or_else(|| anyhow::anyhow!("schema_version is empty after migration"))
}

/// Highest applied schema version, `None` on a database never migrated.
pub fn current_version(conn: &Connection) -> Result<Option<i64>> {
    let has_table: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    if has_table == 0 {
        return Ok(None);
    }
    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get::<_, Option<i64>>(0))
        .optional()?
        .flatten();
    Ok(version)
}
