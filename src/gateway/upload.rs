//! `POST /documents` — multipart document upload into a session's RAG index.

use super::{GatewayState, bearer_is_valid, unauthorized};
use crate::adapters::VectorChunk;
use crate::persistence::models::{DocumentRow, DocumentStatus};
use crate::rag::document::{chunk_text, normalize_text};
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use tracing::warn;

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

pub async fn upload_document(State(state): State<GatewayState>, headers: HeaderMap, mut multipart: Multipart) -> impl IntoResponse {
    if !bearer_is_valid(&headers, &state.bearer_token) {
        return unauthorized();
    }

    let mut filename = String::new();
    let mut session_id = String::new();
    let mut raw_bytes: Vec<u8> = Vec::new();
    let mut chunk_size = state.chunk_size;
    let mut chunk_overlap = state.chunk_overlap;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                return bad_request(format!("multipart error: {e}"));
            }
        };

        match field.name().unwrap_or_default() {
            "file" => {
                filename = field.file_name().unwrap_or("upload").to_owned();
                raw_bytes = match field.bytes().await {
                    Ok(b) => b.to_vec(),
                    Err(e) => return bad_request(format!("failed to read file: {e}")),
                };
            }
            "session_id" => {
                session_id = field.text().await.unwrap_or_default();
            }
            "chunk_size" => {
                if let Ok(text) = field.text().await {
                    chunk_size = text.trim().parse().unwrap_or(chunk_size);
                }
            }
            "chunk_overlap" => {
                if let Ok(text) = field.text().await {
                    chunk_overlap = text.trim().parse().unwrap_or(chunk_overlap);
                }
            }
            _ => {}
        }
    }

    if session_id.is_empty() {
        return bad_request("session_id is required".to_owned());
    }
    if raw_bytes.is_empty() {
        return bad_request("file is required".to_owned());
    }
    if raw_bytes.len() > MAX_UPLOAD_BYTES {
        return bad_request("file exceeds the 10 MB limit".to_owned());
    }
    if !(100..=2_000).contains(&chunk_size) {
        return bad_request("chunk_size must be in [100, 2000]".to_owned());
    }
    if chunk_overlap >= chunk_size || chunk_overlap > 500 {
        return bad_request("chunk_overlap must be in [0, 500] and smaller than chunk_size".to_owned());
    }

    let text = normalize_text(&String::from_utf8_lossy(&raw_bytes));
    let word_count = text.split_whitespace().count() as u32;
    let document_id = uuid::Uuid::new_v4().to_string();

    if let Some(repository) = &state.repository
        && let Err(e) = repository.insert_document(&DocumentRow {
            id: document_id.clone(),
            session_id: session_id.clone(),
            filename: filename.clone(),
            status: DocumentStatus::Processing,
            word_count,
            chunk_count: 0,
            error: None,
        })
    {
        warn!("failed to record document {document_id}: {e}");
    }

    let chunks = chunk_text(&text, chunk_size, chunk_overlap);
    let mut vector_chunks = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        let embedding = match state.embedder.embed(&chunk.text).await {
            Ok(e) => e,
            Err(e) => {
                mark_failed(&state, &document_id, &e.to_string());
                return server_error(format!("embedding failed: {e}"));
            }
        };
        vector_chunks.push(VectorChunk {
            document_id: document_id.clone(),
            session_id: session_id.clone(),
            chunk_index: chunk.index,
            text: chunk.text.clone(),
            embedding,
        });
    }

    if let Err(e) = state.vector_store.upsert(vector_chunks).await {
        mark_failed(&state, &document_id, &e.to_string());
        return server_error(format!("vector upsert failed: {e}"));
    }

    if let Some(repository) = &state.repository
        && let Err(e) = repository.update_document_status(&document_id, DocumentStatus::Completed, word_count, chunks.len() as u32, None)
    {
        warn!("failed to finalize document {document_id}: {e}");
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "document_id": document_id,
            "filename": filename,
            "status": "completed",
            "word_count": word_count,
            "chunk_count": chunks.len(),
        })),
    )
        .into_response()
}

fn mark_failed(state: &GatewayState, document_id: &str, error: &str) {
    if let Some(repository) = &state.repository
        && let Err(e) = repository.update_document_status(document_id, DocumentStatus::Failed, 0, 0, Some(error))
    {
        warn!("failed to record failure for document {document_id}: {e}");
    }
}

fn bad_request(message: String) -> axum::response::Response {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": message}))).into_response()
}

fn server_error(message: String) -> axum::response::Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": message}))).into_response()
}
