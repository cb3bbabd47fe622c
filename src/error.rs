//! Error types for the turn controller.

use crate::rag::guardrails::GuardrailViolation;

/// Top-level error type for turn orchestration.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// STT stream could not be established or dropped and exhausted its
    /// reconnect budget.
    #[error("STT_CONNECTION_FAILED: {0}")]
    SttConnectionFailed(String),

    /// LLM endpoint unreachable or auth failed.
    #[error("LLM_CONNECTION_FAILED: {0}")]
    LlmConnectionFailed(String),

    /// TTS endpoint unreachable or auth failed.
    #[error("TTS_CONNECTION_FAILED: {0}")]
    TtsConnectionFailed(String),

    /// Vector store unreachable.
    #[error("VECTOR_CONNECTION_FAILED: {0}")]
    VectorConnectionFailed(String),

    /// LLM generation exceeded its 15s deadline.
    #[error("LLM_TIMEOUT: generation stalled after {0:?}")]
    LlmTimeout(std::time::Duration),

    /// The sentence queue produced nothing for 20s; synthesis gave up.
    #[error("SENTENCE_QUEUE_TIMEOUT: no sentence for {0:?}")]
    SentenceQueueTimeout(std::time::Duration),

    /// Client never acknowledged playback within 15s.
    #[error("PLAYBACK_TIMEOUT: no playback_complete after {0:?}")]
    PlaybackTimeout(std::time::Duration),

    /// SPEAKING state watchdog fired (30s without completion).
    #[error("SPEAKING_TIMEOUT: stuck in SPEAKING for {0:?}")]
    SpeakingWatchdog(std::time::Duration),

    /// A guardrail rejected the query, retrieval, or response.
    #[error("guardrail_{0:?}: {1}")]
    Guardrail(GuardrailViolation, String),

    /// Document upload failed validation (4xx) or processing.
    #[error("upload error: {0}")]
    Upload(String),

    /// Configuration is missing a required key or has an invalid value.
    #[error("config error: {0}")]
    Config(String),

    /// Vector store / persistence I/O error.
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl ControllerError {
    /// Stable machine-readable code, as emitted in the `error` transport message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SttConnectionFailed(_) => "STT_CONNECTION_FAILED",
            Self::LlmConnectionFailed(_) => "LLM_CONNECTION_FAILED",
            Self::TtsConnectionFailed(_) => "TTS_CONNECTION_FAILED",
            Self::VectorConnectionFailed(_) => "VECTOR_CONNECTION_FAILED",
            Self::LlmTimeout(_) => "llm_timeout",
            Self::SentenceQueueTimeout(_) => "tts_queue_timeout",
            Self::PlaybackTimeout(_) => "playback_timeout",
            Self::SpeakingWatchdog(_) => "speaking_timeout",
            Self::Guardrail(v, _) => v.code(),
            Self::Upload(_) => "upload_error",
            Self::Config(_) => "config_error",
            Self::Storage(_) => "storage_error",
            Self::Io(_) => "io_error",
            Self::Channel(_) => "channel_error",
        }
    }

    /// Whether the caller may retry / the session can continue.
    pub fn recoverable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ControllerError>;
