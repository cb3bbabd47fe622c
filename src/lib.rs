//! Turn Controller: real-time orchestration for spoken human/agent
//! conversation.
//!
//! Cascades STT → (silence detection) → retrieval-augmented generation →
//! sentence-level TTS, coordinated by a five-state turn machine so agent
//! audio is only ever audible after both a silence confirmation and a
//! first-sentence commitment.
//!
//! # Architecture
//!
//! - **State machine** (`turn::state_machine`) — IDLE/LISTENING/
//!   SPECULATIVE/COMMITTED/SPEAKING and the legal transition graph.
//! - **Transcript buffer** (`turn::transcript_buffer`) — interim vs. final
//!   text, with a lock while generation owns the turn.
//! - **Silence timer** (`turn::silence_timer`) — adaptive debounce for
//!   end-of-turn detection.
//! - **Retrieval** (`rag`) — query rewriting, embedding cache, adaptive
//!   thresholds, and the guardrails between retrieved context and the model.
//! - **Turn controller** (`turn::controller`) — ties the above together
//!   per session.
//! - **Gateway** (`gateway`) — the WebSocket/HTTP surface clients speak to.

pub mod adapters;
pub mod config;
pub mod error;
pub mod gateway;
pub mod persistence;
pub mod rag;
mod text;
pub mod turn;

pub use config::Config;
pub use error::{ControllerError, Result};
pub use turn::{TelemetrySnapshot, TurnController, TurnControllerSettingsInit};
