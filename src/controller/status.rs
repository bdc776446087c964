//! What the display sees.
//!
//! The controller publishes a [`StatusSnapshot`] on every state change.
//! Sinks must return quickly; they are called on the controller task.

use tokio::sync::watch;

use super::state::{InteractionState, RetryCounter};
use crate::llm::ConversationTurn;

/// Number of history turns included in a snapshot.
pub const DISPLAYED_TURNS: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub state: InteractionState,
    pub status_text: String,
    /// The last [`DISPLAYED_TURNS`] turns, oldest first.
    pub recent_history: Vec<ConversationTurn>,
    /// The command transcript while it is being answered.
    pub pending_input: Option<String>,
    /// A one-off message: an apology, or why automatic listening stopped.
    pub notice: Option<String>,
    pub failures: RetryCounter,
}

impl StatusSnapshot {
    pub fn initial(wake_phrase: &str) -> Self {
        Self {
            state: InteractionState::Initializing,
            status_text: InteractionState::Initializing.status_text(wake_phrase),
            recent_history: Vec::new(),
            pending_input: None,
            notice: None,
            failures: RetryCounter::default(),
        }
    }

    /// The status line, then what was heard, the reply being spoken and
    /// any notice.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![format!("[{}] {}", self.state, self.status_text)];
        if let Some(input) = &self.pending_input {
            lines.push(format!("  you: {input}"));
        }
        if self.state == InteractionState::Speaking {
            if let Some(reply) = self.recent_history.last().and_then(|t| t.assistant.as_deref()) {
                lines.push(format!("  assistant: {reply}"));
            }
        }
        if let Some(notice) = &self.notice {
            lines.push(format!("  {notice}"));
        }
        lines
    }
}

pub trait DisplaySink: Send + Sync {
    fn update(&self, snapshot: &StatusSnapshot);
}

/// Writes each snapshot to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDisplay;

impl DisplaySink for LogDisplay {
    fn update(&self, snapshot: &StatusSnapshot) {
        for line in snapshot.lines() {
            log::info!("display: {line}");
        }
    }
}

/// Discards everything.  Used when the display is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDisplay;

impl DisplaySink for NoDisplay {
    fn update(&self, _snapshot: &StatusSnapshot) {}
}

/// Publishes the latest snapshot on a `watch` channel.  Slow readers skip
/// intermediate snapshots.
#[derive(Debug)]
pub struct WatchDisplay {
    tx: watch::Sender<StatusSnapshot>,
}

impl WatchDisplay {
    pub fn new(wake_phrase: &str) -> (Self, watch::Receiver<StatusSnapshot>) {
        let (tx, rx) = watch::channel(StatusSnapshot::initial(wake_phrase));
        (Self { tx }, rx)
    }
}

impl DisplaySink for WatchDisplay {
    fn update(&self, snapshot: &StatusSnapshot) {
        // send_replace never fails, even with no receivers left.
        self.tx.send_replace(snapshot.clone());
    }
}
