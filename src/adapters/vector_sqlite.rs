//! SQLite + `sqlite-vec` backed [`VectorStore`].

use crate::adapters::{VectorChunk, VectorStore};
use crate::error::{ControllerError, Result};
use crate::rag::RetrievalResult;
use async_trait::async_trait;
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// Embedding vector dimensions (all-MiniLM-L6-v2).
const EMBEDDING_DIM: usize = 384;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS document_chunks (
    id          TEXT PRIMARY KEY,
    document_id TEXT NOT NULL,
    session_id  TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    text        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_document ON document_chunks(document_id);
CREATE INDEX IF NOT EXISTS idx_chunks_session  ON document_chunks(session_id);
"#;

fn vec_schema_sql() -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunk_embeddings USING vec0(\
            chunk_id TEXT PRIMARY KEY, \
            embedding FLOAT[{EMBEDDING_DIM}]\
        );"
    )
}

fn ensure_sqlite_vec_loaded() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // SAFETY: `sqlite3_vec_init` is the documented SQLite extension entry
        // point shipped by the `sqlite-vec` crate, statically linked.
        unsafe {
            type ExtEntryPoint = unsafe extern "C" fn(
                *mut rusqlite::ffi::sqlite3,
                *mut *const i8,
                *const rusqlite::ffi::sqlite3_api_routines,
            ) -> i32;

            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute::<
                *const (),
                ExtEntryPoint,
            >(sqlite_vec::sqlite3_vec_init as *const ())));
        }
    });
}

/// Vector store for document chunks, backed by a single SQLite file and the
/// `sqlite-vec` `vec0` virtual table for KNN search.
pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
}

impl SqliteVectorStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        ensure_sqlite_vec_loaded();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ControllerError::Storage(format!("failed to open {}: {e}", path.display())))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| ControllerError::Storage(format!("schema apply failed: {e}")))?;
        conn.execute_batch(&vec_schema_sql())
            .map_err(|e| ControllerError::Storage(format!("vec schema apply failed: {e}")))?;
        info!("vector store ready: {}", path.display());
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database, useful for tests.
    pub fn open_in_memory() -> Result<Self> {
        ensure_sqlite_vec_loaded();
        let conn =
            Connection::open_in_memory().map_err(|e| ControllerError::Storage(format!("open in-memory failed: {e}")))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| ControllerError::Storage(format!("schema apply failed: {e}")))?;
        conn.execute_batch(&vec_schema_sql())
            .map_err(|e| ControllerError::Storage(format!("vec schema apply failed: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ControllerError::Storage(format!("vector store lock poisoned: {e}")))
    }
}

fn to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Convert an L2 distance between two unit vectors into a cosine similarity
/// score in `[0, 1]`: `||a - b||^2 = 2 - 2*cos(a, b)`.
fn distance_to_score(distance: f64) -> f32 {
    (1.0 - (distance as f32) / 2.0).clamp(0.0, 1.0)
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn search(
        &self,
        query_embedding: &[f32],
        session_id: &str,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<RetrievalResult>> {
        if query_embedding.len() != EMBEDDING_DIM {
            return Err(ControllerError::Storage(format!(
                "query embedding dimension mismatch: expected {EMBEDDING_DIM}, got {}",
                query_embedding.len()
            )));
        }

        let conn = self.lock()?;
        let blob = to_blob(query_embedding);

        // Oversample from the KNN index, then filter by session and score
        // in application code (vec0 doesn't support auxiliary WHERE clauses
        // across the join cheaply for small corpora).
        let oversample = (top_k.saturating_mul(4)).max(20);
        let mut stmt = conn
            .prepare(
                "SELECT chunk_id, distance FROM chunk_embeddings \
                 WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
            )
            .map_err(|e| ControllerError::Storage(format!("prepare search failed: {e}")))?;

        let candidates: Vec<(String, f64)> = stmt
            .query_map(params![blob, oversample as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })
            .map_err(|e| ControllerError::Storage(format!("search query failed: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ControllerError::Storage(format!("search row decode failed: {e}")))?;

        let mut results = Vec::new();
        for (chunk_id, distance) in candidates {
            let row: Option<(String, String, usize, String)> = conn
                .query_row(
                    "SELECT id, document_id, chunk_index, text FROM document_chunks \
                     WHERE id = ?1 AND session_id = ?2",
                    params![chunk_id, session_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .ok();

            let Some((id, document_id, chunk_index, text)) = row else {
                continue;
            };

            let score = distance_to_score(distance);
            if score < min_score {
                continue;
            }

            results.push(RetrievalResult {
                source_id: document_id,
                chunk_id: format!("{id}#{chunk_index}"),
                text,
                score,
                is_summary_query: false,
                effective_threshold: min_score,
            });

            if results.len() >= top_k {
                break;
            }
        }

        Ok(results)
    }

    async fn upsert(&self, chunks: Vec<VectorChunk>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        for batch in chunks.chunks(100) {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| ControllerError::Storage(format!("begin transaction failed: {e}")))?;
            for chunk in batch {
                if chunk.embedding.len() != EMBEDDING_DIM {
                    return Err(ControllerError::Storage(format!(
                        "chunk embedding dimension mismatch: expected {EMBEDDING_DIM}, got {}",
                        chunk.embedding.len()
                    )));
                }
                let id = format!("{}::{}", chunk.document_id, chunk.chunk_index);
                tx.execute(
                    "INSERT OR REPLACE INTO document_chunks \
                     (id, document_id, session_id, chunk_index, text) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, chunk.document_id, chunk.session_id, chunk.chunk_index as i64, chunk.text],
                )
                .map_err(|e| ControllerError::Storage(format!("chunk insert failed: {e}")))?;

                tx.execute("DELETE FROM chunk_embeddings WHERE chunk_id = ?1", params![id])
                    .map_err(|e| ControllerError::Storage(format!("embedding delete failed: {e}")))?;
                tx.execute(
                    "INSERT INTO chunk_embeddings (chunk_id, embedding) VALUES (?1, ?2)",
                    params![id, to_blob(&chunk.embedding)],
                )
                .map_err(|e| ControllerError::Storage(format!("embedding insert failed: {e}")))?;
            }
            tx.commit()
                .map_err(|e| ControllerError::Storage(format!("commit failed: {e}")))?;
        }
        Ok(())
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let ids: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT id FROM document_chunks WHERE document_id = ?1")
                .map_err(|e| ControllerError::Storage(format!("prepare delete failed: {e}")))?;
            stmt.query_map(params![document_id], |row| row.get(0))
                .map_err(|e| ControllerError::Storage(format!("delete query failed: {e}")))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ControllerError::Storage(format!("delete row decode failed: {e}")))?
        };
        for id in &ids {
            conn.execute("DELETE FROM chunk_embeddings WHERE chunk_id = ?1", params![id])
                .map_err(|e| ControllerError::Storage(format!("embedding delete failed: {e}")))?;
        }
        conn.execute("DELETE FROM document_chunks WHERE document_id = ?1", params![document_id])
            .map_err(|e| ControllerError::Storage(format!("chunk delete failed: {e}")))?;
        Ok(())
    }

    async fn delete_by_session(&self, session_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let ids: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT id FROM document_chunks WHERE session_id = ?1")
                .map_err(|e| ControllerError::Storage(format!("prepare delete failed: {e}")))?;
            stmt.query_map(params![session_id], |row| row.get(0))
                .map_err(|e| ControllerError::Storage(format!("delete query failed: {e}")))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ControllerError::Storage(format!("delete row decode failed: {e}")))?
        };
        for id in &ids {
            conn.execute("DELETE FROM chunk_embeddings WHERE chunk_id = ?1", params![id])
                .map_err(|e| ControllerError::Storage(format!("embedding delete failed: {e}")))?;
        }
        conn.execute("DELETE FROM document_chunks WHERE session_id = ?1", params![session_id])
            .map_err(|e| ControllerError::Storage(format!("chunk delete failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_vec(idx: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[idx] = 1.0;
        v
    }

    #[tokio::test]
    async fn upsert_and_search_roundtrip() {
        let store = SqliteVectorStore::open_in_memory().expect("open");
        store
            .upsert(vec![VectorChunk {
                document_id: "doc1".into(),
                session_id: "s1".into(),
                chunk_index: 0,
                text: "hello world".into(),
                embedding: unit_vec(0),
            }])
            .await
            .expect("upsert");

        let results = store.search(&unit_vec(0), "s1", 5, 0.5).await.expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_id, "doc1");
        assert!(results[0].score > 0.99);
    }

    #[tokio::test]
    async fn search_respects_session_isolation() {
        let store = SqliteVectorStore::open_in_memory().expect("open");
        store
            .upsert(vec![VectorChunk {
                document_id: "doc1".into(),
                session_id: "s1".into(),
                chunk_index: 0,
                text: "hello".into(),
                embedding: unit_vec(0),
            }])
            .await
            .expect("upsert");

        let results = store.search(&unit_vec(0), "s2", 5, 0.0).await.expect("search");
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn search_filters_by_min_score() {
        let store = SqliteVectorStore::open_in_memory().expect("open");
        store
            .upsert(vec![VectorChunk {
                document_id: "doc1".into(),
                session_id: "s1".into(),
                chunk_index: 0,
                text: "orthogonal chunk".into(),
                embedding: unit_vec(1),
            }])
            .await
            .expect("upsert");

        // unit_vec(0) is orthogonal to unit_vec(1) -> cosine 0 -> score ~0
        let results = store.search(&unit_vec(0), "s1", 5, 0.5).await.expect("search");
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn delete_by_document_removes_chunks() {
        let store = SqliteVectorStore::open_in_memory().expect("open");
        store
            .upsert(vec![VectorChunk {
                document_id: "doc1".into(),
                session_id: "s1".into(),
                chunk_index: 0,
                text: "hello".into(),
                embedding: unit_vec(0),
            }])
            .await
            .expect("upsert");

        store.delete_by_document("doc1").await.expect("delete");
        let results = store.search(&unit_vec(0), "s1", 5, 0.0).await.expect("search");
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn delete_by_session_removes_chunks() {
        let store = SqliteVectorStore::open_in_memory().expect("open");
        store
            .upsert(vec![VectorChunk {
                document_id: "doc1".into(),
                session_id: "s1".into(),
                chunk_index: 0,
                text: "hello".into(),
                embedding: unit_vec(0),
            }])
            .await
            .expect("upsert");

        store.delete_by_session("s1").await.expect("delete");
        let results = store.search(&unit_vec(0), "s1", 5, 0.0).await.expect("search");
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn upsert_rejects_wrong_dimension() {
        let store = SqliteVectorStore::open_in_memory().expect("open");
        let err = store
            .upsert(vec![VectorChunk {
                document_id: "doc1".into(),
                session_id: "s1".into(),
                chunk_index: 0,
                text: "bad".into(),
                embedding: vec![0.0; 10],
            }])
            .await;
        assert!(err.is_err());
    }
}
