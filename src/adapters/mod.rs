//! External adapter contracts.
//!
//! Everything in this module is a thin contract surface between the Turn
//! Controller and the systems it depends on but does not own: STT, LLM,
//! TTS, the vector store, and the client transport. Network clients for
//! STT/TTS/Transport are intentionally not shipped — those remain
//! interfaces plus in-memory test doubles, per this system's scope.

pub mod llm_http;
pub mod test_doubles;
pub mod vector_sqlite;

use crate::error::Result;
use crate::rag::RetrievalResult;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A single interim or final transcript event from the STT stream.
#[derive(Debug, Clone)]
pub enum SttEvent {
    /// Non-final text, subject to revision.
    Interim { text: String, confidence: f32 },
    /// Committed text, sole input to generation.
    Final {
        text: String,
        confidence: f32,
        /// Set when the provider's own end-of-turn detector fired
        /// (e.g. Deepgram's `utterance_end_ms`/`speech_final`).
        speech_final: bool,
    },
    /// Provider-level turn-boundary hint: speech started.
    SpeechStarted,
    /// Provider-level hint: an end-of-turn is likely before silence
    /// confirms it. Maps to an immediate final-transcript callback plus
    /// permission to start SPECULATIVE without waiting for the timer.
    EagerEndOfTurn { text: String, confidence: f32 },
    /// Provider-level hint: the user resumed speaking after an eager
    /// end-of-turn. Maps to SPECULATIVE-cancellation handling.
    TurnResumed,
    /// The provider confirmed end-of-turn.
    EndOfTurn,
    /// A non-fatal stream error.
    Error(String),
}

/// Streaming speech-to-text contract.
#[async_trait]
pub trait SttAdapter: Send + Sync {
    /// Push a chunk of raw audio bytes.
    async fn send_audio(&self, audio: &[u8]) -> Result<()>;

    /// Ask the provider to finalize any pending utterance. May be a no-op
    /// for providers without an explicit flush.
    async fn finish_utterance(&self) -> Result<()>;

    /// Tear down the stream.
    async fn disconnect(&self) -> Result<()>;
}

/// One message in an LLM conversation.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Role of a [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// Streaming LLM generation contract.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Issue a minimal request to establish the connection ahead of first use.
    async fn warm_up(&self) -> Result<()>;

    /// Stream response tokens for the given messages. Each yielded item is
    /// one decoded text fragment; the stream ends when generation completes
    /// or `cancel` is triggered.
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<String>>>;
}

/// Streaming text-to-speech contract.
#[async_trait]
pub trait TtsAdapter: Send + Sync {
    /// Issue a minimal request to establish the connection ahead of first use.
    async fn warm_up(&self) -> Result<()>;

    /// Synthesize `text`, yielding raw audio chunks until complete or
    /// cancelled.
    async fn synthesize(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<Vec<u8>>>>;
}

/// A chunk ready to be upserted into the vector store.
#[derive(Debug, Clone)]
pub struct VectorChunk {
    pub document_id: String,
    pub session_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Vector similarity search contract.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Search for the `top_k` chunks most similar to `query_embedding`
    /// scoring at or above `min_score`.
    async fn search(
        &self,
        query_embedding: &[f32],
        session_id: &str,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<RetrievalResult>>;

    /// Upsert chunks in batches of at most 100.
    async fn upsert(&self, chunks: Vec<VectorChunk>) -> Result<()>;

    /// Delete all chunks belonging to one document.
    async fn delete_by_document(&self, document_id: &str) -> Result<()>;

    /// Delete all chunks belonging to one session.
    async fn delete_by_session(&self, session_id: &str) -> Result<()>;
}

/// Local or remote text embedding contract.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text` into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Outbound message delivery, keyed by session id.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a server-to-client message, serialized as JSON text.
    async fn send(&self, session_id: &str, message: serde_json::Value) -> Result<()>;
}
