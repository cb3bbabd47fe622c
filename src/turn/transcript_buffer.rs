//! Transcript buffer: separates interim (display-only) text from final
//! (LLM input) text, with locking during SPECULATIVE/COMMITTED.
//!
//! Critical rule: interim transcripts are never sent to the LLM — only
//! [`TranscriptBuffer::final_text`] is ever read by generation.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// A single transcript entry with metadata.
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    /// Transcript text.
    pub text: String,
    /// STT confidence in `[0, 1]`.
    pub confidence: f32,
    /// Whether this is a final (vs interim) entry.
    pub is_final: bool,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Accumulates interim and final transcripts for the current turn.
#[derive(Debug, Default)]
pub struct TranscriptBuffer {
    finals: Vec<TranscriptEntry>,
    current_interim: String,
    locked: bool,
}

impl TranscriptBuffer {
    /// Create an empty, unlocked buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an interim (display-only) transcript. Dropped silently while
    /// locked.
    pub fn add_interim(&mut self, text: &str, _confidence: f32) {
        if self.locked {
            warn!("buffer is locked - ignoring interim transcript");
            return;
        }
        self.current_interim = text.to_owned();
        debug!("added interim transcript: {}", truncate(text));
    }

    /// Record a final (LLM-input) transcript. Dropped silently while locked.
    /// Clears the current interim.
    pub fn add_final(&mut self, text: &str, confidence: f32) {
        if self.locked {
            warn!("buffer is locked - ignoring final transcript");
            return;
        }
        self.finals.push(TranscriptEntry {
            text: text.to_owned(),
            confidence,
            is_final: true,
            timestamp: Utc::now(),
        });
        self.current_interim.clear();
        info!("added final transcript: {text}");
    }

    /// All final transcripts, space-joined — the sole input to generation.
    pub fn final_text(&self) -> String {
        self.finals
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The most recent interim text, for UI display.
    pub fn current_interim(&self) -> &str {
        &self.current_interim
    }

    /// Mean confidence across final entries, or 0.0 if none.
    pub fn average_final_confidence(&self) -> f32 {
        if self.finals.is_empty() {
            return 0.0;
        }
        self.finals.iter().map(|e| e.confidence).sum::<f32>() / self.finals.len() as f32
    }

    /// Lock the buffer: subsequent `add_*` calls are dropped.
    pub fn lock(&mut self) {
        self.locked = true;
        debug!("buffer locked");
    }

    /// Unlock the buffer.
    pub fn unlock(&mut self) {
        self.locked = false;
        debug!("buffer unlocked");
    }

    /// Whether the buffer is currently locked.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Whether any final transcript has been recorded.
    pub fn has_finals(&self) -> bool {
        !self.finals.is_empty()
    }

    /// Clear all entries and reset the lock.
    pub fn clear(&mut self) {
        self.finals.clear();
        self.current_interim.clear();
        self.locked = false;
        debug!("buffer cleared");
    }
}

fn truncate(s: &str) -> String {
    crate::text::truncate_with_ellipsis(s, 50)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_clears_interim() {
        let mut buf = TranscriptBuffer::new();
        buf.add_interim("hel", 0.4);
        buf.add_final("hello", 0.9);
        assert_eq!(buf.current_interim(), "");
        assert_eq!(buf.final_text(), "hello");
    }

    #[test]
    fn locked_drops_adds() {
        let mut buf = TranscriptBuffer::new();
        buf.add_final("first", 0.9);
        buf.lock();
        buf.add_final("second", 0.9);
        buf.add_interim("third", 0.5);
        assert_eq!(buf.final_text(), "first");
        assert_eq!(buf.current_interim(), "");
    }

    #[test]
    fn clear_resets_lock() {
        let mut buf = TranscriptBuffer::new();
        buf.lock();
        buf.clear();
        assert!(!buf.is_locked());
        buf.add_final("now allowed", 0.8);
        assert_eq!(buf.final_text(), "now allowed");
    }

    #[test]
    fn average_confidence() {
        let mut buf = TranscriptBuffer::new();
        assert_eq!(buf.average_final_confidence(), 0.0);
        buf.add_final("a", 0.8);
        buf.add_final("b", 0.6);
        assert!((buf.average_final_confidence() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn joins_finals_with_space() {
        let mut buf = TranscriptBuffer::new();
        buf.add_final("hello", 0.9);
        buf.add_final("world", 0.9);
        assert_eq!(buf.final_text(), "hello world");
    }
}
