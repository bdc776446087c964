//! Bounded conversation history.
//!
//! [`ConversationHistory`] keeps the last `max_turns` exchanges, evicting
//! the oldest first.  Only the controller mutates it, and only after a
//! successful reply; the orchestrator reads it.

use std::collections::VecDeque;

/// One user utterance and the assistant's reply, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub user: String,
    pub assistant: Option<String>,
}

impl ConversationTurn {
    pub fn new(user: impl Into<String>, assistant: Option<String>) -> Self {
        Self {
            user: user.into(),
            assistant,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
    max_turns: usize,
}

impl ConversationHistory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_turns + 1),
            max_turns,
        }
    }

    /// Append `turn`, dropping the oldest entries beyond the bound.
    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    /// Oldest first.
    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    /// The `n` most recent turns, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
