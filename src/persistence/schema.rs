//! SQLite DDL for turn/session/document bookkeeping.
//!
//! Lives alongside the `vec_embeddings` virtual table defined in
//! [`crate::adapters::vector_sqlite`], in the same database file.

use rusqlite::Connection;

/// Complete DDL for the turn controller's relational tables.
///
/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY,
    created_at      INTEGER NOT NULL,
    last_active_at  INTEGER NOT NULL,
    total_turns     INTEGER NOT NULL DEFAULT 0,
    cancelled_turns INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS turns (
    id              TEXT PRIMARY KEY,
    session_id      TEXT NOT NULL,
    user_text       TEXT NOT NULL,
    agent_text      TEXT NOT NULL,
    trajectory_json TEXT NOT NULL,
    started_at      INTEGER NOT NULL,
    ended_at        INTEGER NOT NULL,
    was_interrupted INTEGER NOT NULL DEFAULT 0,
    avg_confidence  REAL NOT NULL DEFAULT 0.0
);

CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id);

CREATE TABLE IF NOT EXISTS llm_calls (
    id                TEXT PRIMARY KEY,
    turn_id           TEXT NOT NULL,
    status            TEXT NOT NULL,
    prompt_tokens     INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    latency_ms        INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_llm_calls_turn ON llm_calls(turn_id);

CREATE TABLE IF NOT EXISTS documents (
    id           TEXT PRIMARY KEY,
    session_id   TEXT NOT NULL,
    filename     TEXT NOT NULL,
    status       TEXT NOT NULL,
    word_count   INTEGER NOT NULL DEFAULT 0,
    chunk_count  INTEGER NOT NULL DEFAULT 0,
    error        TEXT
);

CREATE INDEX IF NOT EXISTS idx_documents_session ON documents(session_id);

CREATE TABLE IF NOT EXISTS telemetry_samples (
    session_id        TEXT NOT NULL,
    timestamp         INTEGER NOT NULL,
    cancellation_rate REAL NOT NULL,
    avg_debounce_ms   REAL NOT NULL,
    turn_latency_ms   INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_telemetry_session ON telemetry_samples(session_id);
"#;

/// Current relational schema version.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Apply the full schema to an open connection. Safe to call repeatedly.
pub fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_schema_creates_all_tables() {
        let conn = Connection::open_in_memory().expect("open");
        apply_schema(&conn).expect("apply schema");

        for table in ["sessions", "turns", "llm_calls", "documents", "telemetry_samples"] {
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    rusqlite::params![table],
                    |row| row.get(0),
                )
                .expect("query sqlite_master");
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn apply_schema_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        apply_schema(&conn).expect("first apply");
        apply_schema(&conn).expect("second apply");
    }
}
