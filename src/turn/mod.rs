//! Turn orchestration: the per-session state machine, transcript buffer,
//! silence timer, conversation history, transport message shapes, and the
//! controller that ties them together.

pub mod controller;
pub mod conversation_history;
pub mod messages;
pub mod silence_timer;
pub mod state_machine;
pub mod transcript_buffer;

pub use controller::{TelemetrySnapshot, TurnController, TurnControllerSettingsInit};
pub use conversation_history::{ConversationHistory, HistoryTurn};
pub use messages::{AudioFormat, ClientMessage, HistoryTurnWire, Sentence, ServerMessage};
pub use silence_timer::SilenceTimer;
pub use state_machine::{StateMachine, TransitionRecord, TurnState};
pub use transcript_buffer::{TranscriptBuffer, TranscriptEntry};
