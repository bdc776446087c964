//! The interaction controller and what it publishes.
//!
//! # Architecture
//!
//! ```text
//! ControllerCommand (mpsc) ──┐
//!                            ▼
//!              InteractionController::run()   ← single tokio task, owns
//!                            │                  state, session, segment,
//!                            │                  history, retry counters
//!     ┌──────────────┬───────┴──────┬────────────────┬──────────────┐
//!     ▼              ▼              ▼                ▼              ▼
//! AudioSource    Recorder     ClipConverter   TranscriptionClient  ConversationOrchestrator
//!  (acquire)   (segments)      (canonical)      (wake / command)    → SpeechSynthesizer
//!
//!                            │
//!                            ▼
//!                 DisplaySink::update(StatusSnapshot)
//! ```

pub mod runner;
pub mod state;
pub mod status;

#[cfg(test)]
mod testing;

pub use runner::{Collaborators, ControllerCommand, InteractionController};
pub use state::{FailureClass, InteractionState, RetryCounter};
pub use status::{DisplaySink, LogDisplay, NoDisplay, StatusSnapshot, WatchDisplay};
