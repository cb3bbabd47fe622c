//! Relational bookkeeping: sessions, turns, LLM calls, documents, and
//! adaptive-timing telemetry, persisted in the same SQLite database as the
//! vector index.

pub mod models;
pub mod schema;

use crate::error::{ControllerError, Result};
use models::{DocumentRow, DocumentStatus, LlmCallRow, SessionRow, TelemetrySampleRow, TurnRow};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

/// Repository over the turn-bookkeeping tables.
pub struct TurnRepository {
    conn: Mutex<Connection>,
}

impl TurnRepository {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ControllerError::Storage(format!("failed to open {}: {e}", path.display())))?;
        schema::apply_schema(&conn).map_err(|e| ControllerError::Storage(format!("schema apply failed: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database, useful for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| ControllerError::Storage(format!("open in-memory failed: {e}")))?;
        schema::apply_schema(&conn).map_err(|e| ControllerError::Storage(format!("schema apply failed: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ControllerError::Storage(format!("repository lock poisoned: {e}")))
    }

    /// Insert a new session row, or bump its activity counters if it
    /// already exists.
    pub fn upsert_session(&self, id: &str, now: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (id, created_at, last_active_at, total_turns, cancelled_turns) \
             VALUES (?1, ?2, ?2, 0, 0) \
             ON CONFLICT(id) DO UPDATE SET last_active_at = ?2",
            params![id, now],
        )
        .map_err(|e| ControllerError::Storage(format!("upsert_session failed: {e}")))?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRow>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, created_at, last_active_at, total_turns, cancelled_turns FROM sessions WHERE id = ?1",
            params![id],
            |row| {
                Ok(SessionRow {
                    id: row.get(0)?,
                    created_at: row.get(1)?,
                    last_active_at: row.get(2)?,
                    total_turns: row.get::<_, i64>(3)? as u32,
                    cancelled_turns: row.get::<_, i64>(4)? as u32,
                })
            },
        )
        .optional()
        .map_err(|e| ControllerError::Storage(format!("get_session failed: {e}")))
    }

    /// Record the completion of a turn: inserts the [`TurnRow`] and bumps
    /// the owning session's counters.
    pub fn insert_turn(&self, turn: &TurnRow) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO turns \
             (id, session_id, user_text, agent_text, trajectory_json, started_at, ended_at, was_interrupted, avg_confidence) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                turn.id,
                turn.session_id,
                turn.user_text,
                turn.agent_text,
                turn.trajectory_json,
                turn.started_at,
                turn.ended_at,
                turn.was_interrupted as i64,
                turn.avg_confidence,
            ],
        )
        .map_err(|e| ControllerError::Storage(format!("insert_turn failed: {e}")))?;

        conn.execute(
            "UPDATE sessions SET total_turns = total_turns + 1, \
             cancelled_turns = cancelled_turns + ?1, last_active_at = ?2 WHERE id = ?3",
            params![turn.was_interrupted as i64, turn.ended_at, turn.session_id],
        )
        .map_err(|e| ControllerError::Storage(format!("session counter update failed: {e}")))?;

        Ok(())
    }

    pub fn insert_llm_call(&self, call: &LlmCallRow) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO llm_calls (id, turn_id, status, prompt_tokens, completion_tokens, latency_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![call.id, call.turn_id, call.status.as_str(), call.prompt_tokens, call.completion_tokens, call.latency_ms],
        )
        .map_err(|e| ControllerError::Storage(format!("insert_llm_call failed: {e}")))?;
        Ok(())
    }

    pub fn insert_document(&self, doc: &DocumentRow) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO documents (id, session_id, filename, status, word_count, chunk_count, error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![doc.id, doc.session_id, doc.filename, doc.status.as_str(), doc.word_count, doc.chunk_count, doc.error],
        )
        .map_err(|e| ControllerError::Storage(format!("insert_document failed: {e}")))?;
        Ok(())
    }

    pub fn update_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        word_count: u32,
        chunk_count: u32,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE documents SET status = ?1, word_count = ?2, chunk_count = ?3, error = ?4 WHERE id = ?5",
                params![status.as_str(), word_count, chunk_count, error, id],
            )
            .map_err(|e| ControllerError::Storage(format!("update_document_status failed: {e}")))?;
        if rows == 0 {
            return Err(ControllerError::Storage(format!("document not found: {id}")));
        }
        Ok(())
    }

    pub fn get_document(&self, id: &str) -> Result<Option<DocumentRow>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, session_id, filename, status, word_count, chunk_count, error FROM documents WHERE id = ?1",
            params![id],
            |row| {
                let status_str: String = row.get(3)?;
                Ok(DocumentRow {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    filename: row.get(2)?,
                    status: DocumentStatus::from_str(&status_str).unwrap_or(DocumentStatus::Failed),
                    word_count: row.get(4)?,
                    chunk_count: row.get(5)?,
                    error: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(|e| ControllerError::Storage(format!("get_document failed: {e}")))
    }

    pub fn insert_telemetry_sample(&self, sample: &TelemetrySampleRow) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO telemetry_samples (session_id, timestamp, cancellation_rate, avg_debounce_ms, turn_latency_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sample.session_id,
                sample.timestamp,
                sample.cancellation_rate,
                sample.avg_debounce_ms,
                sample.turn_latency_ms
            ],
        )
        .map_err(|e| ControllerError::Storage(format!("insert_telemetry_sample failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::LlmCallStatus;

    #[test]
    fn upsert_session_creates_then_updates() {
        let repo = TurnRepository::open_in_memory().expect("open");
        repo.upsert_session("s1", 100).expect("insert");
        let s = repo.get_session("s1").expect("get").expect("found");
        assert_eq!(s.created_at, 100);
        assert_eq!(s.last_active_at, 100);

        repo.upsert_session("s1", 200).expect("update");
        let s = repo.get_session("s1").expect("get").expect("found");
        assert_eq!(s.created_at, 100);
        assert_eq!(s.last_active_at, 200);
    }

    #[test]
    fn insert_turn_bumps_session_counters() {
        let repo = TurnRepository::open_in_memory().expect("open");
        repo.upsert_session("s1", 0).expect("session");
        repo.insert_turn(&TurnRow {
            id: "t1".into(),
            session_id: "s1".into(),
            user_text: "hi".into(),
            agent_text: "hello".into(),
            trajectory_json: "[]".into(),
            started_at: 0,
            ended_at: 10,
            was_interrupted: true,
            avg_confidence: 0.9,
        })
        .expect("insert turn");

        let s = repo.get_session("s1").expect("get").expect("found");
        assert_eq!(s.total_turns, 1);
        assert_eq!(s.cancelled_turns, 1);
    }

    #[test]
    fn document_lifecycle() {
        let repo = TurnRepository::open_in_memory().expect("open");
        repo.insert_document(&DocumentRow {
            id: "d1".into(),
            session_id: "s1".into(),
            filename: "notes.txt".into(),
            status: DocumentStatus::Processing,
            word_count: 0,
            chunk_count: 0,
            error: None,
        })
        .expect("insert");

        repo.update_document_status("d1", DocumentStatus::Completed, 120, 4, None)
            .expect("update");

        let d = repo.get_document("d1").expect("get").expect("found");
        assert_eq!(d.status, DocumentStatus::Completed);
        assert_eq!(d.word_count, 120);
        assert_eq!(d.chunk_count, 4);
    }

    #[test]
    fn update_missing_document_errors() {
        let repo = TurnRepository::open_in_memory().expect("open");
        let err = repo.update_document_status("missing", DocumentStatus::Failed, 0, 0, Some("oops"));
        assert!(err.is_err());
    }

    #[test]
    fn insert_llm_call_and_telemetry() {
        let repo = TurnRepository::open_in_memory().expect("open");
        repo.upsert_session("s1", 0).expect("session");
        repo.insert_turn(&TurnRow {
            id: "t1".into(),
            session_id: "s1".into(),
            user_text: "hi".into(),
            agent_text: "hello".into(),
            trajectory_json: "[]".into(),
            started_at: 0,
            ended_at: 10,
            was_interrupted: false,
            avg_confidence: 0.9,
        })
        .expect("insert turn");

        repo.insert_llm_call(&LlmCallRow {
            id: "c1".into(),
            turn_id: "t1".into(),
            status: LlmCallStatus::Completed,
            prompt_tokens: 50,
            completion_tokens: 20,
            latency_ms: 340,
        })
        .expect("insert call");

        repo.insert_telemetry_sample(&TelemetrySampleRow {
            session_id: "s1".into(),
            timestamp: 10,
            cancellation_rate: 0.1,
            avg_debounce_ms: 400.0,
            turn_latency_ms: 900,
        })
        .expect("insert telemetry");
    }
}
