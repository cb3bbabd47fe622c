//! Row types persisted alongside the vector table.

use serde::{Deserialize, Serialize};

/// One conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: String,
    pub created_at: i64,
    pub last_active_at: i64,
    pub total_turns: u32,
    pub cancelled_turns: u32,
}

/// One completed turn within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRow {
    pub id: String,
    pub session_id: String,
    pub user_text: String,
    pub agent_text: String,
    /// JSON-serialized `Vec<TransitionRecord>` for this turn.
    pub trajectory_json: String,
    pub started_at: i64,
    pub ended_at: i64,
    pub was_interrupted: bool,
    pub avg_confidence: f32,
}

/// Status of one LLM call within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmCallStatus {
    Completed,
    Canceled,
    Failed,
    SpeculativeCanceled,
}

impl LlmCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
            Self::SpeculativeCanceled => "speculative_canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Self::Completed),
            "canceled" => Some(Self::Canceled),
            "failed" => Some(Self::Failed),
            "speculative_canceled" => Some(Self::SpeculativeCanceled),
            _ => None,
        }
    }
}

/// One LLM generation attempt, possibly cancelled mid-flight by a barge-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallRow {
    pub id: String,
    pub turn_id: String,
    pub status: LlmCallStatus,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
}

/// Status of a document upload/ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A document uploaded into a session's RAG index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRow {
    pub id: String,
    pub session_id: String,
    pub filename: String,
    pub status: DocumentStatus,
    pub word_count: u32,
    pub chunk_count: u32,
    pub error: Option<String>,
}

/// A periodic telemetry sample for a session's adaptive-timing behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySampleRow {
    pub session_id: String,
    pub timestamp: i64,
    pub cancellation_rate: f32,
    pub avg_debounce_ms: f32,
    pub turn_latency_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_call_status_round_trips_through_str() {
        for status in [
            LlmCallStatus::Completed,
            LlmCallStatus::Canceled,
            LlmCallStatus::Failed,
            LlmCallStatus::SpeculativeCanceled,
        ] {
            assert_eq!(LlmCallStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn document_status_round_trips_through_str() {
        for status in [DocumentStatus::Processing, DocumentStatus::Completed, DocumentStatus::Failed] {
            assert_eq!(DocumentStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn unknown_status_string_is_none() {
        assert_eq!(LlmCallStatus::from_str("bogus"), None);
        assert_eq!(DocumentStatus::from_str("bogus"), None);
    }
}
