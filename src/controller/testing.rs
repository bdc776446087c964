//! Scripted collaborators and a harness for driving the real controller loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::runner::{Collaborators, ControllerCommand, InteractionController};
use super::state::InteractionState;
use super::status::{DisplaySink, StatusSnapshot};
use crate::audio::{
    AcquisitionError, AcquisitionReason, AudioSource, CanonicalClip, CaptureConstraints, ChunkTap,
    Clip, ClipConverter, ConversionError, Session, StreamEncoding,
};
use crate::config::AssistantConfig;
use crate::llm::{ChatRequest, LlmClient, LlmError};
use crate::speech::{SpeechSynthesizer, TtsError, Utterance};
use crate::stt::{ClipPurpose, TranscriptionClient, TranscriptionError};

const WAIT: Duration = Duration::from_secs(5);

/// Millisecond-scale timings so the loop turns over quickly.
pub fn fast_config() -> AssistantConfig {
    let mut config = AssistantConfig::default();
    config.audio.wake_chunk_ms = 30;
    config.audio.recording_ms = 60;
    config.audio.min_clip_bytes = 1;
    config.audio.acquire_timeout_ms = 1_000;
    config.audio.resume_delay_ms = 10;
    config.retry.ceiling = 5;
    config.retry.backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.display.timeout_ms = 5_000;
    config.speech.enabled = true;
    config
}

/// States visited, with consecutive repeats collapsed.
pub fn states(snapshots: &[StatusSnapshot]) -> Vec<InteractionState> {
    let mut out: Vec<InteractionState> = Vec::new();
    for s in snapshots {
        if out.last() != Some(&s.state) {
            out.push(s.state);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

/// In-memory microphone.  A feeding source pushes 10 ms PCM chunks from a
/// thread until its session is released.
pub struct FakeSource {
    feed: bool,
    fail: Option<AcquisitionReason>,
    panics: bool,
    acquisitions: AtomicUsize,
    releases: Arc<AtomicUsize>,
}

impl FakeSource {
    fn build(feed: bool, fail: Option<AcquisitionReason>, panics: bool) -> Arc<Self> {
        Arc::new(Self {
            feed,
            fail,
            panics,
            acquisitions: AtomicUsize::new(0),
            releases: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn feeding() -> Arc<Self> {
        Self::build(true, None, false)
    }

    /// Opens fine but never delivers a byte.
    pub fn silent() -> Arc<Self> {
        Self::build(false, None, false)
    }

    pub fn failing(reason: AcquisitionReason) -> Arc<Self> {
        Self::build(false, Some(reason), false)
    }

    /// A driver that crashes while opening the device.
    pub fn panicking() -> Arc<Self> {
        Self::build(false, None, true)
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl AudioSource for FakeSource {
    fn acquire(&self, _constraints: &CaptureConstraints) -> Result<Session, AcquisitionError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("driver crashed");
        }
        if let Some(reason) = self.fail {
            return Err(AcquisitionError::new(reason, "scripted failure"));
        }

        let tap = Arc::new(ChunkTap::new());
        let stopped = Arc::new(AtomicBool::new(false));
        if self.feed {
            let tap = Arc::clone(&tap);
            let stopped = Arc::clone(&stopped);
            std::thread::spawn(move || {
                let chunk = vec![0u8; 320];
                while !stopped.load(Ordering::SeqCst) {
                    tap.deliver(&chunk);
                    std::thread::sleep(Duration::from_millis(5));
                }
            });
        }

        let releases = Arc::clone(&self.releases);
        Ok(Session::new(
            StreamEncoding::Pcm16 {
                sample_rate: 16_000,
                channels: 1,
            },
            tap,
            move || {
                stopped.store(true, Ordering::SeqCst);
                releases.fetch_add(1, Ordering::SeqCst);
            },
        ))
    }
}

/// Returns half a second of silence for every clip.
pub struct CountingConverter {
    pub calls: AtomicUsize,
}

impl CountingConverter {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ClipConverter for CountingConverter {
    async fn to_canonical(&self, _clip: &Clip) -> Result<CanonicalClip, ConversionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CanonicalClip::from_pcm16(vec![0; 8_000]))
    }
}

// ---------------------------------------------------------------------------
// Transcription
// ---------------------------------------------------------------------------

type Transcript = Result<String, TranscriptionError>;

/// Wake chunks get the scripted transcripts in order, then `wake_default`;
/// every command clip gets `command`.
pub struct ScriptedTranscriber {
    wake: Mutex<VecDeque<Transcript>>,
    wake_default: Transcript,
    wake_delay: Duration,
    command: Transcript,
    pub wake_calls: AtomicUsize,
    pub command_calls: AtomicUsize,
}

impl ScriptedTranscriber {
    pub fn new(wake: Vec<Transcript>, wake_default: Transcript, command: Transcript) -> Arc<Self> {
        Self::slow_wake(Duration::ZERO, wake, wake_default, command)
    }

    /// Wake transcripts are taken when the call starts and delivered after
    /// `delay`.
    pub fn slow_wake(
        delay: Duration,
        wake: Vec<Transcript>,
        wake_default: Transcript,
        command: Transcript,
    ) -> Arc<Self> {
        Arc::new(Self {
            wake: Mutex::new(wake.into()),
            wake_default,
            wake_delay: delay,
            command,
            wake_calls: AtomicUsize::new(0),
            command_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TranscriptionClient for ScriptedTranscriber {
    async fn transcribe(&self, _clip: &CanonicalClip, purpose: ClipPurpose) -> Transcript {
        match purpose {
            ClipPurpose::WakeWord => {
                self.wake_calls.fetch_add(1, Ordering::SeqCst);
                let next = self.wake.lock().unwrap().pop_front();
                let transcript = next.unwrap_or_else(|| self.wake_default.clone());
                tokio::time::sleep(self.wake_delay).await;
                transcript
            }
            ClipPurpose::Command => {
                self.command_calls.fetch_add(1, Ordering::SeqCst);
                self.command.clone()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Language model and speech
// ---------------------------------------------------------------------------

pub struct ScriptedLlm {
    reply: Result<String, LlmError>,
    delay: Duration,
}

impl ScriptedLlm {
    pub fn ok(reply: &str) -> Arc<Self> {
        Self::slow(reply, Duration::ZERO)
    }

    pub fn slow(reply: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(reply.to_string()),
            delay,
        })
    }

    pub fn err(error: LlmError) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(error),
            delay: Duration::ZERO,
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _request: &ChatRequest) -> Result<String, LlmError> {
        tokio::time::sleep(self.delay).await;
        self.reply.clone()
    }
}

/// Never answers.
pub struct HangingLlm;

#[async_trait]
impl LlmClient for HangingLlm {
    async fn complete(&self, _request: &ChatRequest) -> Result<String, LlmError> {
        std::future::pending().await
    }
}

/// Records every utterance it is asked to speak.  `completed` only counts
/// utterances that ran to the end.
#[derive(Default)]
pub struct RecordingSpeaker {
    spoken: Mutex<Vec<String>>,
    completed: AtomicUsize,
    delay: Duration,
    fail: Option<TtsError>,
}

impl RecordingSpeaker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Takes `delay` to say anything.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn failing(error: TtsError) -> Arc<Self> {
        Arc::new(Self {
            fail: Some(error),
            ..Self::default()
        })
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for RecordingSpeaker {
    async fn speak(&self, utterance: &Utterance) -> Result<(), TtsError> {
        self.spoken.lock().unwrap().push(utterance.text.clone());
        tokio::time::sleep(self.delay).await;
        if let Some(error) = &self.fail {
            return Err(error.clone());
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Display and harness
// ---------------------------------------------------------------------------

/// Keeps every snapshot, in order.
pub struct RecordingDisplay {
    tx: watch::Sender<Vec<StatusSnapshot>>,
}

impl RecordingDisplay {
    pub fn new() -> (Arc<Self>, watch::Receiver<Vec<StatusSnapshot>>) {
        let (tx, rx) = watch::channel(Vec::new());
        (Arc::new(Self { tx }), rx)
    }
}

impl DisplaySink for RecordingDisplay {
    fn update(&self, snapshot: &StatusSnapshot) {
        self.tx.send_modify(|all| all.push(snapshot.clone()));
    }
}

pub struct Harness {
    commands: mpsc::Sender<ControllerCommand>,
    snapshots: watch::Receiver<Vec<StatusSnapshot>>,
    task: JoinHandle<()>,
}

impl Harness {
    pub fn start(
        config: AssistantConfig,
        source: Arc<dyn AudioSource>,
        converter: Arc<dyn ClipConverter>,
        transcriber: Arc<dyn TranscriptionClient>,
        llm: Arc<dyn LlmClient>,
        speaker: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        let (display, snapshots) = RecordingDisplay::new();
        let controller = InteractionController::new(
            config,
            Collaborators {
                source,
                converter,
                transcriber,
                llm,
                speaker,
                display,
            },
        );
        let (commands, rx) = mpsc::channel(16);
        let task = tokio::spawn(controller.run(rx));
        Self {
            commands,
            snapshots,
            task,
        }
    }

    pub async fn send(&self, command: ControllerCommand) {
        self.commands.send(command).await.expect("controller running");
    }

    /// Snapshots published so far.
    pub fn len(&self) -> usize {
        self.snapshots.borrow().len()
    }

    /// Wait until `done` holds for the snapshots so far, then return them.
    pub async fn wait_for(
        &mut self,
        mut done: impl FnMut(&[StatusSnapshot]) -> bool,
    ) -> Vec<StatusSnapshot> {
        let result = timeout(WAIT, self.snapshots.wait_for(|all| done(all)))
            .await
            .map(|r| r.map(|all| all.clone()));
        match result {
            Ok(Ok(all)) => all,
            Ok(Err(_)) => panic!("controller stopped publishing"),
            Err(_) => {
                let seen = states(&self.snapshots.borrow());
                panic!("timed out waiting; states so far: {seen:?}")
            }
        }
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(ControllerCommand::Shutdown).await;
        timeout(WAIT, self.task)
            .await
            .expect("controller stopped in time")
            .expect("controller task");
    }
}
