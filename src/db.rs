use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

pub const DB_FILE_NAME: &str = "resultsd.sqlite3";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!("failed to create workspace {}", workspace.to_string_lossy())
    })?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    // Other processes may hold the write lock while snapshotting.
    conn.busy_timeout(BUSY_TIMEOUT)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_periods(
            year INTEGER NOT NULL,
            month INTEGER NOT NULL,
            test_set_name TEXT NOT NULL,
            clean_sample_size INTEGER NOT NULL,
            locked INTEGER NOT NULL DEFAULT 0,
            snapshot_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(year, month),
            CHECK(month BETWEEN 1 AND 12),
            CHECK(clean_sample_size >= 0),
            CHECK(locked = 0 OR snapshot_at IS NOT NULL)
        )",
        [],
    )?;
    ensure_result_periods_snapshot_digest(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_rows(
            id TEXT PRIMARY KEY,
            year INTEGER NOT NULL,
            month INTEGER NOT NULL,
            product_id TEXT NOT NULL,
            product_name TEXT,
            vm_name TEXT,
            stage TEXT,
            cert_miss INTEGER,
            fps INTEGER,
            cfn_preview INTEGER,
            cfn_final INTEGER,
            original TEXT,
            private_flag INTEGER NOT NULL DEFAULT 0,
            inv_res_flag INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(year, month) REFERENCES result_periods(year, month),
            UNIQUE(year, month, product_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_result_rows_period ON result_rows(year, month)",
        [],
    )?;

    Ok(())
}

// Workspaces created before snapshot digests existed lack the column.
fn ensure_result_periods_snapshot_digest(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "result_periods", "snapshot_digest")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE result_periods ADD COLUMN snapshot_digest TEXT",
        [],
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(
            serde_json::from_str(&text)
                .with_context(|| format!("settings value for {} is invalid JSON", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_init_is_repeatable() {
        let conn = Connection::open_in_memory().expect("open memory db");
        init_schema(&conn).expect("first init");
        init_schema(&conn).expect("second init");
        assert!(table_has_column(&conn, "result_periods", "snapshot_digest").unwrap());
    }

    #[test]
    fn legacy_period_table_gains_digest_column() {
        let conn = Connection::open_in_memory().expect("open memory db");
        conn.execute(
            "CREATE TABLE result_periods(
                year INTEGER NOT NULL,
                month INTEGER NOT NULL,
                test_set_name TEXT NOT NULL,
                clean_sample_size INTEGER NOT NULL,
                locked INTEGER NOT NULL DEFAULT 0,
                snapshot_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY(year, month)
            )",
            [],
        )
        .unwrap();
        init_schema(&conn).expect("migrate");
        assert!(table_has_column(&conn, "result_periods", "snapshot_digest").unwrap());
    }

    #[test]
    fn settings_roundtrip_and_overwrite() {
        let conn = Connection::open_in_memory().expect("open memory db");
        init_schema(&conn).unwrap();
        assert_eq!(settings_get_json(&conn, "k").unwrap(), None);
        settings_set_json(&conn, "k", &json!({ "a": 1 })).unwrap();
        settings_set_json(&conn, "k", &json!({ "a": 2 })).unwrap();
        assert_eq!(settings_get_json(&conn, "k").unwrap(), Some(json!({ "a": 2 })));
    }
}
