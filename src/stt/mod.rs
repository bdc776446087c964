//! Speech-to-text collaborators.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │              TranscriptionClient (trait)                 │
//! │                                                          │
//! │   ┌──────────────────┐        ┌──────────────────────┐   │
//! │   │ HttpTranscriber  │        │ WhisperTranscriber   │   │
//! │   │ POST /transcribe │        │ (feature "whisper")  │   │
//! │   │ GET  /status     │        │ spawn_blocking + ctx │   │
//! │   └──────────────────┘        └──────────────────────┘   │
//! │                                                          │
//! │   CanonicalClip + ClipPurpose ──▶ Ok(text) | Err(kind)   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The backend is chosen by `TranscriptionConfig::backend`.

pub mod client;
pub mod http;
#[cfg(feature = "whisper")]
pub mod whisper;

pub use client::{ClipPurpose, TranscriptionClient, TranscriptionError};
pub use http::{HttpTranscriber, ServiceStatus};
#[cfg(feature = "whisper")]
pub use whisper::WhisperTranscriber;

