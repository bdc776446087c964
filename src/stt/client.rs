//! Transcription client trait and error taxonomy.
//!
//! [`TranscriptionClient`] is the seam between the controller and whatever
//! turns canonical audio into text.  It is object-safe and `Send + Sync` so
//! the controller holds it as `Arc<dyn TranscriptionClient>`.
//!
//! An empty transcript is a valid result meaning "no speech in this clip";
//! it is never reported as an error.

use async_trait::async_trait;
use thiserror::Error;

use crate::audio::CanonicalClip;

// ---------------------------------------------------------------------------
// ClipPurpose
// ---------------------------------------------------------------------------

/// What a clip is for.  Wake chunks use a shorter time budget than commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipPurpose {
    WakeWord,
    Command,
}

// ---------------------------------------------------------------------------
// TranscriptionError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscriptionError {
    #[error("transcription service refused the connection")]
    Refused,

    #[error("transcription timed out")]
    Timeout,

    #[error("transcription service returned HTTP {status}")]
    Http { status: u16 },

    /// The service answered `success: false` with a real error.
    #[error("transcription service error: {0}")]
    Service(String),

    #[error("unexpected transcription response: {0}")]
    Malformed(String),

    /// Transport failure that is neither a refusal nor a timeout.
    #[error("transcription request failed: {0}")]
    Request(String),

    /// In-process engine failure.
    #[error("transcription engine failed: {0}")]
    Engine(String),
}

impl From<reqwest::Error> for TranscriptionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Refused
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// TranscriptionClient trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TranscriptionClient: Send + Sync {
    /// Transcribe `clip`.  `Ok("")` means no speech was detected.
    async fn transcribe(
        &self,
        clip: &CanonicalClip,
        purpose: ClipPurpose,
    ) -> Result<String, TranscriptionError>;
}
