//! Bounded recording segments.
//!
//! [`Recorder::start_segment`] attaches a collector task to the session's
//! [`ChunkTap`](super::source::ChunkTap) and returns a [`SegmentHandle`].
//! The collector stops on whichever comes first: an explicit stop request or
//! `max_duration` elapsing.  It then detaches, drains anything already
//! queued, and publishes a single outcome on a `watch` channel, so every
//! later `stop()` / `finished()` call observes the same [`Clip`].
//!
//! ```text
//! start_segment ──▶ collector task ──select!──┬─ stop requested
//!                                             ├─ deadline
//!                                             └─ chunk ▶ push
//!                   detach ▶ drain ▶ finalise ▶ watch::send(outcome)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::source::{AttachError, ChunkTap, Session, StreamEncoding};
use super::wav::{pcm16_header, WAV_HEADER_LEN};

// ---------------------------------------------------------------------------
// MimeHint / Clip
// ---------------------------------------------------------------------------

/// Container a clip was captured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeHint {
    Wav,
    Webm,
    Ogg,
    Unknown,
}

impl MimeHint {
    /// File extension, used as a probe hint and as the conversion format tag.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Webm => "webm",
            Self::Ogg => "ogg",
            Self::Unknown => "bin",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Webm => "audio/webm",
            Self::Ogg => "audio/ogg",
            Self::Unknown => "application/octet-stream",
        }
    }
}

/// A finalised recording segment in its captured container.  Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clip {
    chunks: Vec<Vec<u8>>,
    mime: MimeHint,
    duration_hint: Duration,
}

impl Clip {
    pub fn new(chunks: Vec<Vec<u8>>, mime: MimeHint, duration_hint: Duration) -> Self {
        Self {
            chunks,
            mime,
            duration_hint,
        }
    }

    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    pub fn mime(&self) -> MimeHint {
        self.mime
    }

    pub fn duration_hint(&self) -> Duration {
        self.duration_hint
    }

    pub fn byte_len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    /// All chunks concatenated in capture order.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecorderError {
    /// Nothing usable was captured.  Distinct from a clip of silence.
    #[error("no audio captured ({bytes} bytes)")]
    EmptyClip { bytes: usize },

    #[error("another segment is already recording")]
    SegmentBusy,

    #[error("session has been released")]
    SessionReleased,

    #[error("segment ended without an outcome")]
    Aborted,
}

impl From<AttachError> for RecorderError {
    fn from(e: AttachError) -> Self {
        match e {
            AttachError::Busy => Self::SegmentBusy,
            AttachError::Closed => Self::SessionReleased,
        }
    }
}

/// What a finished segment produced.
pub type SegmentOutcome = Result<Arc<Clip>, RecorderError>;

// ---------------------------------------------------------------------------
// SegmentHandle
// ---------------------------------------------------------------------------

/// Handle to one recording segment.  Clones share the same segment.
#[derive(Clone)]
pub struct SegmentHandle {
    id: u64,
    stop: CancellationToken,
    outcome: watch::Receiver<Option<SegmentOutcome>>,
}

impl SegmentHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask the segment to stop without waiting for it.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// `true` until the segment has produced its outcome.
    pub fn is_open(&self) -> bool {
        self.outcome.borrow().is_none()
    }

    /// Wait for the segment to end (timeout or stop) and return its outcome.
    pub async fn finished(&self) -> SegmentOutcome {
        let mut rx = self.outcome.clone();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(current) => current.clone(),
            Err(_) => None,
        };
        result.unwrap_or(Err(RecorderError::Aborted))
    }

    /// Stop the segment and return its clip.  Calling this again returns the
    /// same outcome.
    pub async fn stop(&self) -> SegmentOutcome {
        self.request_stop();
        self.finished().await
    }
}

impl std::fmt::Debug for SegmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentHandle")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

static NEXT_SEGMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Starts bounded segments against a live [`Session`].
#[derive(Debug, Clone)]
pub struct Recorder {
    min_clip_bytes: usize,
}

impl Recorder {
    pub fn new(min_clip_bytes: usize) -> Self {
        Self { min_clip_bytes }
    }

    /// Start recording.  Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`RecorderError::SessionReleased`] for a released session and
    /// [`RecorderError::SegmentBusy`] while another segment is attached.
    pub fn start_segment(
        &self,
        session: &Session,
        max_duration: Duration,
    ) -> Result<SegmentHandle, RecorderError> {
        if session.is_released() {
            return Err(RecorderError::SessionReleased);
        }

        let id = NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed);
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        session.tap().attach(id, chunk_tx)?;

        let stop = CancellationToken::new();
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let collector = Collector {
            id,
            tap: Arc::clone(session.tap()),
            encoding: session.encoding(),
            min_clip_bytes: self.min_clip_bytes,
        };
        tokio::spawn(collector.run(chunk_rx, stop.clone(), max_duration, outcome_tx));

        log::debug!("recorder: segment {id} started (max {max_duration:?})");
        Ok(SegmentHandle {
            id,
            stop,
            outcome: outcome_rx,
        })
    }

    /// Stop `handle` and return its clip.  At-most-once: a repeated call
    /// returns the same outcome.
    pub async fn stop_segment(&self, handle: &SegmentHandle) -> SegmentOutcome {
        handle.stop().await
    }
}

struct Collector {
    id: u64,
    tap: Arc<ChunkTap>,
    encoding: StreamEncoding,
    min_clip_bytes: usize,
}

impl Collector {
    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
        stop: CancellationToken,
        max_duration: Duration,
        outcome: watch::Sender<Option<SegmentOutcome>>,
    ) {
        let started = Instant::now();
        let deadline = tokio::time::sleep(max_duration);
        tokio::pin!(deadline);

        let mut chunks = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = &mut deadline => {
                    log::debug!("recorder: segment {} reached max duration", self.id);
                    break;
                }
                chunk = rx.recv() => match chunk {
                    Some(c) => chunks.push(c),
                    None => break,
                },
            }
        }

        self.tap.detach(self.id);
        while let Ok(c) = rx.try_recv() {
            chunks.push(c);
        }

        let result = self.finalise(chunks, started.elapsed());
        match &result {
            Ok(clip) => log::debug!(
                "recorder: segment {} finished ({} bytes, {:?})",
                self.id,
                clip.byte_len(),
                clip.mime()
            ),
            Err(e) => log::debug!("recorder: segment {} finished: {e}", self.id),
        }
        outcome.send_replace(Some(result));
    }

    fn finalise(&self, chunks: Vec<Vec<u8>>, elapsed: Duration) -> SegmentOutcome {
        match self.encoding {
            StreamEncoding::Container(mime) => {
                let bytes: usize = chunks.iter().map(Vec::len).sum();
                if bytes == 0 || bytes < self.min_clip_bytes {
                    return Err(RecorderError::EmptyClip { bytes });
                }
                Ok(Arc::new(Clip::new(chunks, mime, elapsed)))
            }
            StreamEncoding::Pcm16 {
                sample_rate,
                channels,
            } => {
                let mut data = chunks.concat();
                let block = usize::from(channels.max(1)) * 2;
                data.truncate(data.len() - data.len() % block);

                let bytes = if data.is_empty() {
                    0
                } else {
                    WAV_HEADER_LEN + data.len()
                };
                if bytes == 0 || bytes < self.min_clip_bytes {
                    return Err(RecorderError::EmptyClip { bytes });
                }

                let frames = data.len() / block;
                let duration = if sample_rate > 0 {
                    Duration::from_secs_f64(frames as f64 / f64::from(sample_rate))
                } else {
                    elapsed
                };
                let data_len = u32::try_from(data.len()).unwrap_or(u32::MAX);
                let header = pcm16_header(sample_rate, channels, data_len).to_vec();
                Ok(Arc::new(Clip::new(vec![header, data], MimeHint::Wav, duration)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::WavHeader;

    fn container_session() -> Session {
        Session::new(
            StreamEncoding::Container(MimeHint::Webm),
            Arc::new(ChunkTap::new()),
            || {},
        )
    }

    fn pcm_session(sample_rate: u32, channels: u16) -> Session {
        Session::new(
            StreamEncoding::Pcm16 {
                sample_rate,
                channels,
            },
            Arc::new(ChunkTap::new()),
            || {},
        )
    }

    #[tokio::test]
    async fn stop_returns_chunks_in_order() {
        let session = container_session();
        let recorder = Recorder::new(4);
        let handle = recorder
            .start_segment(&session, Duration::from_secs(5))
            .unwrap();

        session.tap().deliver(b"ab");
        session.tap().deliver(b"cd");
        let clip = handle.stop().await.unwrap();

        assert_eq!(clip.chunks(), &[b"ab".to_vec(), b"cd".to_vec()]);
        assert_eq!(clip.to_bytes(), b"abcd".to_vec());
        assert_eq!(clip.mime(), MimeHint::Webm);
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn second_stop_returns_same_clip() {
        let session = container_session();
        let recorder = Recorder::new(1);
        let handle = recorder
            .start_segment(&session, Duration::from_secs(5))
            .unwrap();
        session.tap().deliver(b"xyz");

        let first = recorder.stop_segment(&handle).await.unwrap();
        let second = recorder.stop_segment(&handle).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn deadline_stops_segment() {
        let session = container_session();
        let recorder = Recorder::new(1);
        let handle = recorder
            .start_segment(&session, Duration::from_millis(30))
            .unwrap();
        session.tap().deliver(b"frame");

        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.finished())
            .await
            .expect("segment should stop on its own");
        assert_eq!(outcome.unwrap().byte_len(), 5);
        assert_eq!(session.tap().attached(), None);
    }

    #[tokio::test]
    async fn nothing_captured_is_empty_clip() {
        let session = container_session();
        let recorder = Recorder::new(1_024);
        let handle = recorder
            .start_segment(&session, Duration::from_secs(5))
            .unwrap();

        assert_eq!(
            handle.stop().await,
            Err(RecorderError::EmptyClip { bytes: 0 })
        );
    }

    #[tokio::test]
    async fn tiny_clip_is_empty_clip() {
        let session = container_session();
        let recorder = Recorder::new(1_024);
        let handle = recorder
            .start_segment(&session, Duration::from_secs(5))
            .unwrap();
        session.tap().deliver(&[0u8; 100]);

        assert_eq!(
            handle.stop().await,
            Err(RecorderError::EmptyClip { bytes: 100 })
        );
    }

    #[tokio::test]
    async fn only_one_segment_at_a_time() {
        let session = container_session();
        let recorder = Recorder::new(1);
        let first = recorder
            .start_segment(&session, Duration::from_secs(5))
            .unwrap();

        assert_eq!(
            recorder
                .start_segment(&session, Duration::from_secs(5))
                .unwrap_err(),
            RecorderError::SegmentBusy
        );

        let _ = first.stop().await;
        let second = recorder
            .start_segment(&session, Duration::from_secs(5))
            .unwrap();
        assert_eq!(session.tap().attached(), Some(second.id()));
    }

    #[tokio::test]
    async fn released_session_refuses_segments() {
        let mut session = container_session();
        session.release();
        let recorder = Recorder::new(1);
        assert_eq!(
            recorder
                .start_segment(&session, Duration::from_secs(1))
                .unwrap_err(),
            RecorderError::SessionReleased
        );
    }

    #[tokio::test]
    async fn pcm_segments_are_wrapped_as_wav() {
        let session = pcm_session(48_000, 2);
        let recorder = Recorder::new(64);
        let handle = recorder
            .start_segment(&session, Duration::from_secs(5))
            .unwrap();

        // 100 stereo frames, plus one stray byte that must be dropped
        session.tap().deliver(&[0u8; 400]);
        session.tap().deliver(&[1u8]);
        let clip = handle.stop().await.unwrap();

        assert_eq!(clip.mime(), MimeHint::Wav);
        let bytes = clip.to_bytes();
        let header = WavHeader::parse(&bytes).unwrap();
        assert_eq!(header.sample_rate, 48_000);
        assert_eq!(header.channels, 2);
        assert_eq!(header.data_len, 400);
        assert_eq!(bytes.len(), WAV_HEADER_LEN + 400);
    }
}
