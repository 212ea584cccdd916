use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    file_name TEXT NOT NULL,
    file_path TEXT NOT NULL,
    file_type TEXT NOT NULL,
    checksum TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'created',
    final_method TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_sessions_checksum ON sessions(checksum);

CREATE TABLE IF NOT EXISTS attempts (
    id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    method TEXT NOT NULL,
    status TEXT NOT NULL,
    transactions_found INTEGER NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0,
    error_message TEXT,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    created_at TEXT DEFAULT (datetime('now')),
    UNIQUE (session_id, sequence),
    FOREIGN KEY (session_id) REFERENCES sessions(id)
);

CREATE TABLE IF NOT EXISTS session_transactions (
    id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    date TEXT NOT NULL,
    amount REAL NOT NULL,
    description TEXT NOT NULL,
    txn_type TEXT NOT NULL,
    balance REAL,
    category TEXT,
    merchant TEXT,
    reference TEXT,
    confidence REAL NOT NULL,
    source TEXT NOT NULL,
    source_line INTEGER,
    FOREIGN KEY (session_id) REFERENCES sessions(id)
);

CREATE TABLE IF NOT EXISTS column_mappings (
    id INTEGER PRIMARY KEY,
    file_type TEXT NOT NULL,
    signature TEXT NOT NULL,
    source_column TEXT NOT NULL,
    field TEXT NOT NULL,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0.5,
    is_active INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT DEFAULT (datetime('now')),
    UNIQUE (signature, source_column, field)
);

CREATE TABLE IF NOT EXISTS regex_patterns (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    file_type TEXT,
    pattern TEXT NOT NULL,
    group_mappings TEXT NOT NULL,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0.5,
    is_builtin INTEGER NOT NULL DEFAULT 0,
    created_at TEXT DEFAULT (datetime('now'))
);
";

// (name, pattern, group mappings as JSON)
const BUILTIN_PATTERNS: &[(&str, &str, &str)] = &[
    (
        "Date / Description / Amount",
        r"^(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})\s+(.+?)\s+(\(?-?\$?[\d,]+\.\d{2}\)?)$",
        r#"{"1":"date","2":"description","3":"amount"}"#,
    ),
    (
        "Date / Description / Debit / Credit",
        r"^(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})\s+(.+?)\s+(\$?[\d,]+\.\d{2}|-)\s+(\$?[\d,]+\.\d{2}|-)$",
        r#"{"1":"date","2":"description","3":"debit","4":"credit"}"#,
    ),
    (
        "Posted Date / Date / Description / Amount / Balance",
        r"^(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})\s+(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})\s+(.+?)\s+(-?\$?[\d,]+\.\d{2})\s+(-?\$?[\d,]+\.\d{2})$",
        r#"{"2":"date","3":"description","4":"amount","5":"balance"}"#,
    ),
];

/// Neutral starting confidence for patterns and mappings with no history.
pub const NEUTRAL_CONFIDENCE: f64 = 0.5;

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    // Sessions in other processes may be bumping the same pattern counters.
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let count: i64 = conn.query_row(
        "SELECT count(*) FROM regex_patterns WHERE is_builtin = 1",
        [],
        |row| row.get(0),
    )?;
    if count == 0 {
        for (name, pattern, groups) in BUILTIN_PATTERNS {
            conn.execute(
                "INSERT INTO regex_patterns (name, file_type, pattern, group_mappings, confidence, is_builtin) \
                 VALUES (?1, NULL, ?2, ?3, ?4, 1)",
                rusqlite::params![name, pattern, groups, NEUTRAL_CONFIDENCE],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_db() -> (tempfile::TempDir, Connection) {
    let dir = tempfile::tempdir().unwrap();
    let conn = get_connection(&dir.path().join("test.db")).unwrap();
    init_db(&conn).unwrap();
    (dir, conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_db_creates_tables() {
        let (_dir, conn) = test_db();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        for expected in &["sessions", "attempts", "session_transactions", "column_mappings", "regex_patterns"] {
            assert!(tables.contains(&expected.to_string()), "missing table: {expected}");
        }
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let (_dir, conn) = test_db();
        init_db(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM regex_patterns", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_builtin_patterns_compile_and_start_neutral() {
        let (_dir, conn) = test_db();
        let mut stmt = conn
            .prepare("SELECT pattern, confidence, success_count, failure_count FROM regex_patterns WHERE is_builtin = 1")
            .unwrap();
        let rows: Vec<(String, f64, i64, i64)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(rows.len(), 3);
        for (pattern, confidence, success, failure) in rows {
            assert!(regex::Regex::new(&pattern).is_ok(), "bad builtin: {pattern}");
            assert_eq!(confidence, NEUTRAL_CONFIDENCE);
            assert_eq!((success, failure), (0, 0));
        }
    }
}
