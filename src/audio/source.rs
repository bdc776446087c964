//! Microphone leases.
//!
//! An [`AudioSource`] hands out at most one live [`Session`] at a time.  The
//! session owns the physical stream (through a stop hook supplied by the
//! source) and a [`ChunkTap`] through which the stream pushes raw byte
//! chunks.  Recorder segments attach to the tap; only one segment can be
//! attached at any instant, which is what keeps two segments from racing
//! for the same microphone.
//!
//! ```text
//! device callback ──deliver()──▶ ChunkTap ──(segment id, tx)──▶ Recorder collector
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;

use super::recorder::MimeHint;
use crate::config::AudioConfig;

// ---------------------------------------------------------------------------
// Constraints and errors
// ---------------------------------------------------------------------------

/// Capture hints.  Sources may ignore any of them; the actual device rate is
/// normalised downstream by the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub preferred_sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            preferred_sample_rate: 16_000,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

impl CaptureConstraints {
    pub fn from_config(audio: &AudioConfig) -> Self {
        Self {
            preferred_sample_rate: audio.preferred_sample_rate,
            channels: 1,
            echo_cancellation: audio.echo_cancellation,
            noise_suppression: audio.noise_suppression,
        }
    }
}

/// Why a microphone could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionReason {
    PermissionDenied,
    NoDevice,
    DeviceBusy,
    Unsupported,
    Timeout,
    Other,
}

impl fmt::Display for AcquisitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PermissionDenied => "permission denied",
            Self::NoDevice => "no device",
            Self::DeviceBusy => "device busy",
            Self::Unsupported => "unsupported configuration",
            Self::Timeout => "timed out",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Single error type for every acquisition failure, tagged with a reason.
#[derive(Debug, Clone, Error)]
#[error("microphone unavailable ({reason}): {detail}")]
pub struct AcquisitionError {
    pub reason: AcquisitionReason,
    pub detail: String,
}

impl AcquisitionError {
    pub fn new(reason: AcquisitionReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// Byte format of the chunks a session delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEncoding {
    /// Interleaved little-endian i16 samples at the device rate.
    Pcm16 { sample_rate: u32, channels: u16 },
    /// Pieces of an encoded container; concatenated they form one file.
    Container(MimeHint),
}

// ---------------------------------------------------------------------------
// ChunkTap
// ---------------------------------------------------------------------------

/// Why a segment could not attach to a tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    /// Another segment is already attached.
    Busy,
    /// The session was released.
    Closed,
}

#[derive(Default)]
struct TapInner {
    closed: bool,
    sink: Option<(u64, mpsc::UnboundedSender<Vec<u8>>)>,
}

/// Fan-in point between a live stream and the one open recorder segment.
#[derive(Default)]
pub struct ChunkTap {
    inner: Mutex<TapInner>,
}

impl ChunkTap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TapInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Forward one chunk to the attached segment, if any.
    ///
    /// Returns `false` when the chunk was dropped (nothing attached, or the
    /// tap is closed).  Safe to call from a device callback thread.
    pub fn deliver(&self, bytes: &[u8]) -> bool {
        let inner = self.lock();
        if inner.closed {
            return false;
        }
        match &inner.sink {
            Some((_, tx)) => tx.send(bytes.to_vec()).is_ok(),
            None => false,
        }
    }

    pub(crate) fn attach(
        &self,
        segment: u64,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<(), AttachError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(AttachError::Closed);
        }
        if inner.sink.is_some() {
            return Err(AttachError::Busy);
        }
        inner.sink = Some((segment, tx));
        Ok(())
    }

    /// Detach `segment`.  A different segment's attachment is left alone.
    pub(crate) fn detach(&self, segment: u64) -> bool {
        let mut inner = self.lock();
        match &inner.sink {
            Some((id, _)) if *id == segment => {
                inner.sink = None;
                true
            }
            _ => false,
        }
    }

    /// Drop whatever segment is attached.  Used when a stop did not complete
    /// within its time budget.
    pub fn force_detach(&self) {
        self.lock().sink = None;
    }

    /// Id of the attached segment, if any.
    pub fn attached(&self) -> Option<u64> {
        self.lock().sink.as_ref().map(|(id, _)| *id)
    }

    fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.sink = None;
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

type StopHook = Box<dyn FnOnce() + Send + Sync>;

/// A microphone lease.  Dropping the session releases it.
pub struct Session {
    id: u64,
    acquired_at: Instant,
    released: bool,
    encoding: StreamEncoding,
    tap: Arc<ChunkTap>,
    stop: Option<StopHook>,
}

impl Session {
    /// Called by sources once the physical stream is running.  `stop` must
    /// halt all capture; it runs exactly once.
    pub fn new(
        encoding: StreamEncoding,
        tap: Arc<ChunkTap>,
        stop: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            acquired_at: Instant::now(),
            released: false,
            encoding,
            tap,
            stop: Some(Box::new(stop)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn encoding(&self) -> StreamEncoding {
        self.encoding
    }

    pub fn tap(&self) -> &Arc<ChunkTap> {
        &self.tap
    }

    /// Stop capture and close the tap.  Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.tap.close();
        if let Some(stop) = self.stop.take() {
            stop();
        }
        log::info!(
            "audio: session {} released after {:.1}s",
            self.id,
            self.acquired_at.elapsed().as_secs_f32()
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("released", &self.released)
            .field("encoding", &self.encoding)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// AudioSource
// ---------------------------------------------------------------------------

/// Something that can open the microphone.
///
/// `acquire` may block (device negotiation); callers run it off the async
/// executor under a timeout.
pub trait AudioSource: Send + Sync {
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<Session, AcquisitionError>;

    fn release(&self, session: &mut Session) {
        session.release();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
