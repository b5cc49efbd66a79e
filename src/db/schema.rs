//! DDL for the archive store.
//!
//! Version 1 of `transcript_entries`. Columns added later live in
//! [`super::migrations`]. Everything uses `IF NOT EXISTS` so initialization is
//! idempotent across concurrent hook processes.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS transcript_entries (
    id TEXT PRIMARY KEY,
    key TEXT NOT NULL,
    content TEXT NOT NULL,
    namespace TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    session_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    summary TEXT NOT NULL DEFAULT '',
    content_hash TEXT NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_namespace ON transcript_entries(namespace);
CREATE INDEX IF NOT EXISTS idx_entries_session ON transcript_entries(session_id);
CREATE INDEX IF NOT EXISTS idx_entries_session_chunk ON transcript_entries(session_id, chunk_index);
CREATE INDEX IF NOT EXISTS idx_entries_created ON transcript_entries(created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_hash ON transcript_entries(namespace, content_hash);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Create the v1 tables. Idempotent.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(conn: &Connection) -> Vec<String> {
        conn.prepare("PRAGMA table_info(transcript_entries)")
            .unwrap()
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn schema_creates_tables_and_vec_functions() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let cols = columns(&conn);
        for expected in ["id", "namespace", "session_id", "chunk_index", "content_hash"] {
            assert!(cols.contains(&expected.to_string()), "missing column {expected}");
        }

        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn duplicate_hash_in_namespace_is_ignored() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let insert = "INSERT OR IGNORE INTO transcript_entries
            (id, key, content, namespace, session_id, chunk_index, content_hash,
             last_accessed_at, created_at, updated_at)
            VALUES (?1, 'k', 'c', ?2, 's', 0, 'h', 0, 0, 0)";
        assert_eq!(conn.execute(insert, ["a", "ns"]).unwrap(), 1);
        assert_eq!(conn.execute(insert, ["b", "ns"]).unwrap(), 0);
        // Same hash in another namespace is a different entry.
        assert_eq!(conn.execute(insert, ["c", "other"]).unwrap(), 1);
    }
}
