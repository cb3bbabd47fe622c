//! Bounded per-session conversation history, rendered into the LLM prompt
//! as alternating `user:`/`assistant:` lines ahead of the new user message.

/// One completed exchange. Interrupted turns still contribute the user's
/// text with an empty `agent_text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub user_text: String,
    pub agent_text: String,
}

/// Append-only, capacity-bounded conversation history for one session.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: Vec<HistoryTurn>,
    capacity: usize,
}

impl ConversationHistory {
    pub const DEFAULT_CAPACITY: usize = 20;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { turns: Vec::new(), capacity }
    }

    /// Append a completed turn, dropping the oldest entry if at capacity.
    pub fn add_turn(&mut self, user_text: impl Into<String>, agent_text: impl Into<String>) {
        if self.turns.len() >= self.capacity {
            self.turns.remove(0);
        }
        self.turns.push(HistoryTurn { user_text: user_text.into(), agent_text: agent_text.into() });
    }

    pub fn turns(&self) -> &[HistoryTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Render as alternating `user:`/`assistant:` lines, oldest first.
    /// Interrupted turns (empty `agent_text`) omit the assistant line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for turn in &self.turns {
            out.push_str("user: ");
            out.push_str(&turn.user_text);
            out.push('\n');
            if !turn.agent_text.is_empty() {
                out.push_str("assistant: ");
                out.push_str(&turn.agent_text);
                out.push('\n');
            }
        }
        out
    }
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_alternating_lines() {
        let mut h = ConversationHistory::new();
        h.add_turn("hi", "hello there");
        h.add_turn("what time is it", "it's noon");
        assert_eq!(h.render(), "user: hi\nassistant: hello there\nuser: what time is it\nassistant: it's noon\n");
    }

    #[test]
    fn interrupted_turn_omits_assistant_line() {
        let mut h = ConversationHistory::new();
        h.add_turn("wait actually", "");
        assert_eq!(h.render(), "user: wait actually\n");
    }

    #[test]
    fn drops_oldest_beyond_capacity() {
        let mut h = ConversationHistory::with_capacity(2);
        h.add_turn("one", "a");
        h.add_turn("two", "b");
        h.add_turn("three", "c");
        assert_eq!(h.len(), 2);
        assert_eq!(h.turns()[0].user_text, "two");
        assert_eq!(h.turns()[1].user_text, "three");
    }

    #[test]
    fn default_capacity_is_twenty() {
        let h = ConversationHistory::new();
        assert_eq!(h.capacity, 20);
    }

    #[test]
    fn clear_empties_history() {
        let mut h = ConversationHistory::new();
        h.add_turn("a", "b");
        h.clear();
        assert!(h.is_empty());
    }
}
