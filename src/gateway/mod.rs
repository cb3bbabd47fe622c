//! WebSocket + HTTP gateway binding client transport to a per-session
//! [`crate::turn::TurnController`].
//!
//! Mirrors the teacher's `channels::gateway` router/state/bearer-auth
//! pattern, generalized from a single webhook route to the turn
//! controller's WebSocket transcript stream plus document upload.

mod transport;
mod upload;
mod ws;

pub use transport::WsTransport;

use crate::adapters::{Embedder, LlmAdapter, SttAdapter, TtsAdapter, VectorStore};
use crate::config::GatewayConfig;
use crate::persistence::TurnRepository;
use crate::rag::RagRetriever;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

/// Shared state threaded through every gateway route.
#[derive(Clone)]
pub struct GatewayState {
    pub stt_factory: Arc<dyn Fn() -> Arc<dyn SttAdapter> + Send + Sync>,
    pub llm: Arc<dyn LlmAdapter>,
    pub tts: Arc<dyn TtsAdapter>,
    pub vector_store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub retriever: Arc<RagRetriever>,
    pub repository: Option<Arc<TurnRepository>>,
    pub bearer_token: Option<String>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

/// Build the gateway router: `GET /ws/{session_id}`, `POST /documents`,
/// `GET /healthz`.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws/{session_id}", get(ws::upgrade))
        .route("/documents", post(upload::upload_document))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Bind and serve the gateway until the process is terminated.
pub async fn run(config: GatewayConfig, state: GatewayState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("turn-controller gateway listening on http://{local_addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `Authorization: Bearer <token>` check. A `None` configured token means
/// auth is disabled (local/dev use).
pub(crate) fn bearer_is_valid(headers: &HeaderMap, expected: &Option<String>) -> bool {
    let Some(expected_token) = expected else {
        return true;
    };
    let header_value = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()).unwrap_or_default();
    let candidate = header_value.strip_prefix("Bearer ").unwrap_or_default().trim();
    !expected_token.is_empty() && candidate == expected_token
}

pub(crate) fn unauthorized() -> axum::response::Response {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "unauthorized"}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_validation_requires_exact_token_match() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc123".parse().expect("header parse"));
        assert!(bearer_is_valid(&headers, &Some("abc123".to_owned())));
        assert!(!bearer_is_valid(&headers, &Some("wrong".to_owned())));
    }

    #[test]
    fn bearer_validation_passes_when_auth_disabled() {
        let headers = HeaderMap::new();
        assert!(bearer_is_valid(&headers, &None));
    }

    #[test]
    fn bearer_validation_rejects_missing_header_when_required() {
        let headers = HeaderMap::new();
        assert!(!bearer_is_valid(&headers, &Some("abc123".to_owned())));
    }
}
