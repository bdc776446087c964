//! Interaction state machine and per-class failure accounting.
//!
//! [`InteractionState`] is the single answer to "what is the assistant doing
//! right now".  Only the controller changes it.
//!
//! [`RetryCounter`] tracks consecutive failures per [`FailureClass`] and
//! trips a class once it reaches the configured ceiling.  A tripped class
//! stays tripped until an explicit resume.

use std::fmt;

// ---------------------------------------------------------------------------
// InteractionState
// ---------------------------------------------------------------------------

/// States of the interaction loop.
///
/// ```text
/// Initializing ──session──▶ WakeListening ──wake match──▶ Recording
///      │                        │  ▲                          │ stop / timer
///      │ acquire failed         │  └──────── done ─────┐      ▼
///      ▼                        │ ceiling          Speaking ◀─ Querying ◀─ Transcribing
/// ManualFallback ◀──────────────┘                      (watchdog covers both)
///      │ trigger ──▶ Recording
/// Error (session released, timers stopped) ──resume──▶ Initializing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionState {
    /// Opening the microphone.
    Initializing,

    /// Recording short chunks and checking each transcript for the wake phrase.
    WakeListening,

    /// Recording the user's command.
    Recording,

    /// Converting and transcribing the command clip.
    Transcribing,

    /// Waiting for the language model.
    Querying,

    /// Speaking the reply (or an apology).
    Speaking,

    /// Automatic listening is off; only an explicit trigger starts a command.
    ManualFallback,

    /// Session released and timers stopped.  Left only by an explicit resume.
    Error,
}

impl InteractionState {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            InteractionState::Initializing => "Initializing",
            InteractionState::WakeListening => "WakeListening",
            InteractionState::Recording => "Recording",
            InteractionState::Transcribing => "Transcribing",
            InteractionState::Querying => "Querying",
            InteractionState::Speaking => "Speaking",
            InteractionState::ManualFallback => "ManualFallback",
            InteractionState::Error => "Error",
        }
    }

    /// User-facing status line.
    ///
    /// ```
    /// use mirror_voice::controller::InteractionState;
    ///
    /// assert_eq!(
    ///     InteractionState::WakeListening.status_text("hello mirror"),
    ///     "Say \"hello mirror\" to start"
    /// );
    /// assert_eq!(InteractionState::Querying.status_text("x"), "Thinking...");
    /// ```
    pub fn status_text(&self, wake_phrase: &str) -> String {
        match self {
            InteractionState::Initializing => "Starting...".to_string(),
            InteractionState::WakeListening => format!("Say \"{wake_phrase}\" to start"),
            InteractionState::Recording => "Listening...".to_string(),
            InteractionState::Transcribing | InteractionState::Querying => {
                "Thinking...".to_string()
            }
            InteractionState::Speaking => "Responding...".to_string(),
            InteractionState::ManualFallback => "Click to talk".to_string(),
            InteractionState::Error => "Voice assistant unavailable".to_string(),
        }
    }

    /// States covered by the reply watchdog.
    pub fn is_watched(&self) -> bool {
        matches!(self, InteractionState::Querying | InteractionState::Speaking)
    }
}

impl fmt::Display for InteractionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// RetryCounter
// ---------------------------------------------------------------------------

/// Which automatic loop a failure counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Wake chunk recording, conversion or transcription.
    WakeWord,
    /// Command recording, conversion or transcription.
    Recording,
    /// Opening the microphone.
    Acquisition,
}

impl FailureClass {
    fn index(self) -> usize {
        match self {
            FailureClass::WakeWord => 0,
            FailureClass::Recording => 1,
            FailureClass::Acquisition => 2,
        }
    }
}

/// Consecutive failures per class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryCounter {
    counts: [u32; 3],
    tripped: [bool; 3],
}

impl RetryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one failure and return the new consecutive total.  The class
    /// trips once the total reaches `ceiling`.
    pub fn record_failure(&mut self, class: FailureClass, ceiling: u32) -> u32 {
        let i = class.index();
        self.counts[i] = self.counts[i].saturating_add(1);
        if self.counts[i] >= ceiling {
            self.tripped[i] = true;
        }
        self.counts[i]
    }

    /// A success resets the count but leaves a trip in place.
    pub fn record_success(&mut self, class: FailureClass) {
        self.counts[class.index()] = 0;
    }

    pub fn count(&self, class: FailureClass) -> u32 {
        self.counts[class.index()]
    }

    pub fn is_tripped(&self, class: FailureClass) -> bool {
        self.tripped[class.index()]
    }

    /// `true` when any class has disabled the automatic loop.
    pub fn any_tripped(&self) -> bool {
        self.tripped.iter().any(|t| *t)
    }

    /// Clear every count and trip.
    pub fn clear_all(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
