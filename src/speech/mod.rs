//! Text-to-speech collaborators.
//!
//! [`SpeechSynthesizer::speak`] resolves when the utterance has finished (or
//! failed).  The controller treats every failure as immediate completion, so
//! implementations only need to report what happened.

pub mod command;

use async_trait::async_trait;
use thiserror::Error;

pub use command::CommandSpeaker;

/// Text plus the voice parameters it should be spoken with.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    /// BCP-47 tag, e.g. `"en-US"`.
    pub language: String,
    /// Relative rate, 1.0 = normal.
    pub rate: f32,
    /// Relative pitch, 1.0 = normal.
    pub pitch: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TtsError {
    #[error("speech engine unavailable: {0}")]
    Unavailable(String),

    #[error("speech engine failed: {0}")]
    Failed(String),

    #[error("utterance did not finish in time")]
    Timeout,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn speak(&self, utterance: &Utterance) -> Result<(), TtsError>;
}

/// Completes every utterance immediately.  Used when speech is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentSpeaker;

#[async_trait]
impl SpeechSynthesizer for SilentSpeaker {
    async fn speak(&self, utterance: &Utterance) -> Result<(), TtsError> {
        log::debug!("speech: (silent) {}", utterance.text);
        Ok(())
    }
}
