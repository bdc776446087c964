//! Audio pipeline: microphone lease → bounded segments → canonical clips.
//!
//! # Pipeline
//!
//! ```text
//! AudioSource::acquire ─▶ Session ─▶ ChunkTap
//!                                      │
//!             Recorder::start_segment ─┘─▶ SegmentHandle ─stop/timeout─▶ Clip
//!                                                                         │
//!          ClipConverter::to_canonical (hound | symphonia | remote) ◀─────┘
//!                      │
//!                      └─▶ CanonicalClip (16 kHz, mono, PCM16) ─▶ WAV bytes
//! ```

pub mod capture;
pub mod convert;
pub mod recorder;
pub mod remote;
pub mod resample;
pub mod source;
pub mod wav;

pub use capture::MicrophoneSource;
pub use convert::{ClipConverter, ConversionError, FormatConverter};
pub use recorder::{Clip, MimeHint, Recorder, RecorderError, SegmentHandle, SegmentOutcome};
pub use remote::RemoteConverter;
pub use resample::{first_channel, resample_to_16k};
pub use source::{
    AcquisitionError, AcquisitionReason, AudioSource, CaptureConstraints, ChunkTap, Session,
    StreamEncoding,
};
pub use wav::{CanonicalClip, WavHeader};
