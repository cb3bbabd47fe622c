//! Client/server transport message shapes and the sentence unit passed
//! from generation to synthesis.

use serde::{Deserialize, Serialize};

/// A sentence-level unit flowing through the bounded Sentence Queue.
///
/// The stream is terminated by the sentinel `Sentence { text: "", is_final: true }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub text: String,
    pub is_final: bool,
}

impl Sentence {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), is_final: false }
    }

    /// The end-of-stream sentinel.
    pub fn sentinel() -> Self {
        Self { text: String::new(), is_final: true }
    }

    pub fn is_sentinel(&self) -> bool {
        self.text.is_empty() && self.is_final
    }
}

/// Audio encoding format for `audio_chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Pcm,
    Wav,
    Webm,
}

/// Inbound message from the client over the transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Connect,
    AudioChunk {
        audio: String,
        format: AudioFormat,
        sample_rate: u32,
    },
    Interrupt {
        timestamp: i64,
    },
    UpdateSettings {
        silence_debounce_ms: Option<u64>,
        cancellation_threshold: Option<f32>,
        adaptive_debounce_enabled: Option<bool>,
        voice_id: Option<String>,
        llm_model: Option<String>,
    },
    Disconnect,
    Ping,
    Pong,
    GetHistory,
}

/// One rendered history turn, as sent in response to `get_history`.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryTurnWire {
    pub user_text: String,
    pub agent_text: String,
}

/// Outbound message to the client over the transport.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionReady {
        session_id: String,
        timestamp: i64,
    },
    StateChange {
        from_state: String,
        to_state: String,
        timestamp: i64,
    },
    TranscriptInterim {
        text: String,
        confidence: f32,
        timestamp: i64,
    },
    TranscriptFinal {
        text: String,
        confidence: f32,
        timestamp: i64,
    },
    AgentAudioChunk {
        audio: String,
        chunk_index: u32,
        is_final: bool,
    },
    AgentTextFallback {
        text: String,
        reason: String,
    },
    TurnComplete {
        turn_id: String,
        user_text: String,
        agent_text: String,
        duration_ms: u64,
        was_interrupted: bool,
        timestamp: i64,
    },
    Telemetry {
        cancellation_rate: f32,
        avg_debounce_ms: f32,
        turn_latency_ms: u64,
        total_turns: u32,
        tokens_wasted: u32,
        interruption_count: u32,
    },
    History {
        turns: Vec<HistoryTurnWire>,
    },
    Error {
        code: String,
        message: String,
        recoverable: bool,
        timestamp: i64,
    },
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_detection() {
        assert!(Sentence::sentinel().is_sentinel());
        assert!(!Sentence::new("hello").is_sentinel());
        assert!(!Sentence { text: String::new(), is_final: false }.is_sentinel());
    }

    #[test]
    fn client_message_deserializes_audio_chunk() {
        let json = r#"{"type":"audio_chunk","data":{"audio":"AAA=","format":"pcm","sample_rate":16000}}"#;
        let msg: ClientMessage = serde_json::from_str(json).expect("deserialize");
        match msg {
            ClientMessage::AudioChunk { sample_rate, format, .. } => {
                assert_eq!(sample_rate, 16000);
                assert_eq!(format, AudioFormat::Pcm);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn server_message_serializes_tagged_shape() {
        let msg = ServerMessage::SessionReady { session_id: "s1".into(), timestamp: 123 };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["type"], "session_ready");
        assert_eq!(json["data"]["session_id"], "s1");
    }

    #[test]
    fn update_settings_fields_are_optional() {
        let json = r#"{"type":"update_settings","data":{}}"#;
        let msg: ClientMessage = serde_json::from_str(json).expect("deserialize");
        assert!(matches!(msg, ClientMessage::UpdateSettings { silence_debounce_ms: None, .. }));
    }
}
