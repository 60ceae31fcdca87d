use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::alloc::AllocPolicy;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("admitd.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            class_name TEXT NOT NULL,
            stream TEXT NOT NULL,
            parent_name TEXT,
            status TEXT NOT NULL,
            access_number TEXT NOT NULL,
            admission_id TEXT NOT NULL,
            flag_comment TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_group ON students(class_name, stream)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_status ON students(status)",
        [],
    )?;

    // The database is the uniqueness authority for live identifiers: client
    // allocation is advisory and a colliding write must be rejected here.
    // Partial indexes cover only enrolled rows so flagged students keep
    // their historical numbers without blocking reuse. Access numbers are
    // unique per class+stream (distinct groups can share a sentinel prefix
    // and thus a number string); admission ids embed the year, so a plain
    // unique index gives per-year uniqueness.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_students_access_enrolled
         ON students(class_name, stream, access_number)
         WHERE status IN ('active', 're-admitted')",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_students_admission_enrolled
         ON students(admission_id)
         WHERE status IN ('active', 're-admitted')",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS dropped_access_numbers(
            access_number TEXT PRIMARY KEY,
            dropped_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    // Workspaces created before flagging carried a comment lack the column.
    ensure_students_flag_comment(&conn)?;

    Ok(conn)
}

fn ensure_students_flag_comment(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "flag_comment")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN flag_comment TEXT", [])?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| r.get(0))
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub const SETTING_REUSE_MAX_ON_EMPTY: &str = "alloc.reuse_max_on_empty";

pub fn alloc_policy(conn: &Connection) -> AllocPolicy {
    let reuse_max_on_empty = settings_get_json(conn, SETTING_REUSE_MAX_ON_EMPTY)
        .ok()
        .flatten()
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    AllocPolicy { reuse_max_on_empty }
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
