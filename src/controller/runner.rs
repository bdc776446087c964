//! Interaction controller: drives the wake → record → transcribe → ask →
//! speak loop.
//!
//! [`InteractionController`] is an actor.  It owns the microphone
//! [`Session`], the one open recorder segment, the conversation history and
//! the [`InteractionState`].  Everything slow runs in spawned tasks that
//! report back over an internal channel.
//!
//! # Flow
//!
//! ```text
//! Initializing ──spawn_blocking(acquire)──▶ Acquired
//!   └─▶ WakeListening: segment(chunk) → convert → transcribe → WakeChunk
//!         ├─ no match / silence → next chunk
//!         ├─ failure            → backoff, next chunk (ceiling → ManualFallback)
//!         └─ match              → Recording: segment(recording) → CommandClip
//!                                   └─▶ Transcribing → CommandTranscript
//!                                         └─▶ Querying → Reply
//!                                               └─▶ Speaking → SpeechDone
//!                                                     └─▶ WakeListening (after resume delay)
//! ```
//!
//! Every state entry replaces a cancellation scope and bumps an epoch.
//! Results carry the epoch they were issued under; anything that arrives
//! after the controller has moved on is dropped.  The reply watchdog has its
//! own token; it is armed on entering Querying and re-armed when Speaking
//! starts, so each phase gets the full bound.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::state::{FailureClass, InteractionState, RetryCounter};
use super::status::{DisplaySink, StatusSnapshot, DISPLAYED_TURNS};
use crate::audio::{
    AcquisitionError, AcquisitionReason, AudioSource, CaptureConstraints, Clip, ClipConverter,
    ConversionError, Recorder, RecorderError, SegmentHandle, SegmentOutcome, Session,
};
use crate::config::AssistantConfig;
use crate::llm::{ConversationHistory, ConversationOrchestrator, ConversationTurn, LlmClient, LlmError};
use crate::speech::{SpeechSynthesizer, TtsError, Utterance};
use crate::stt::{ClipPurpose, TranscriptionClient, TranscriptionError};
use crate::wake::WakeWordMatcher;

/// How long a segment gets to finish after a stop request before the tap is
/// forcibly detached.
const STOP_WAIT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// External requests, e.g. from a button or the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCommand {
    /// Start a command now (click to talk).  While recording, stop early.
    Trigger,
    /// Stop the command recording; the clip is processed.
    StopRecording,
    /// Abandon the command recording; the clip is discarded.
    Sleep,
    /// Release the microphone and wait for a trigger.
    Suspend,
    /// Clear failure counters and start over.
    Resume,
    /// Release everything and stop.
    Shutdown,
}

/// Everything the controller talks to.
pub struct Collaborators {
    pub source: Arc<dyn AudioSource>,
    pub converter: Arc<dyn ClipConverter>,
    pub transcriber: Arc<dyn TranscriptionClient>,
    pub llm: Arc<dyn LlmClient>,
    pub speaker: Arc<dyn SpeechSynthesizer>,
    pub display: Arc<dyn DisplaySink>,
}

// ---------------------------------------------------------------------------
// Internal events
// ---------------------------------------------------------------------------

/// Why a capture → convert → transcribe step produced no text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
enum StepError {
    /// Nothing was captured.  Not counted as a failure.
    #[error("no audio")]
    Silence,

    #[error("recording failed: {0}")]
    Recorder(RecorderError),

    #[error("conversion failed: {0}")]
    Conversion(ConversionError),

    #[error("transcription failed: {0}")]
    Transcription(#[from] TranscriptionError),
}

impl From<RecorderError> for StepError {
    fn from(e: RecorderError) -> Self {
        match e {
            RecorderError::EmptyClip { .. } => StepError::Silence,
            other => StepError::Recorder(other),
        }
    }
}

impl From<ConversionError> for StepError {
    fn from(e: ConversionError) -> Self {
        match e {
            ConversionError::EmptyAudio => StepError::Silence,
            other => StepError::Conversion(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquireIntent {
    /// Start the wake loop once the microphone is open.
    Automatic,
    /// Go straight to command recording.
    Manual,
}

enum Event {
    Acquired {
        ticket: u64,
        intent: AcquireIntent,
        result: Result<Session, AcquisitionError>,
    },
    /// The source panicked while opening the device.
    SourceFailed {
        ticket: u64,
        detail: String,
    },
    WakeChunk {
        ticket: u64,
        result: Result<String, StepError>,
    },
    RestartWake {
        ticket: u64,
    },
    CommandClip {
        ticket: u64,
        outcome: SegmentOutcome,
    },
    CommandTranscript {
        ticket: u64,
        result: Result<String, StepError>,
    },
    Reply {
        ticket: u64,
        result: Result<String, LlmError>,
    },
    SpeechDone {
        ticket: u64,
        result: Result<(), TtsError>,
    },
    Watchdog {
        generation: u64,
    },
}

impl Event {
    fn ticket(&self) -> Option<u64> {
        match self {
            Event::Acquired { ticket, .. }
            | Event::SourceFailed { ticket, .. }
            | Event::WakeChunk { ticket, .. }
            | Event::RestartWake { ticket }
            | Event::CommandClip { ticket, .. }
            | Event::CommandTranscript { ticket, .. }
            | Event::Reply { ticket, .. }
            | Event::SpeechDone { ticket, .. } => Some(*ticket),
            Event::Watchdog { .. } => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Event::Acquired { .. } => "Acquired",
            Event::SourceFailed { .. } => "SourceFailed",
            Event::WakeChunk { .. } => "WakeChunk",
            Event::RestartWake { .. } => "RestartWake",
            Event::CommandClip { .. } => "CommandClip",
            Event::CommandTranscript { .. } => "CommandTranscript",
            Event::Reply { .. } => "Reply",
            Event::SpeechDone { .. } => "SpeechDone",
            Event::Watchdog { .. } => "Watchdog",
        }
    }
}

// ---------------------------------------------------------------------------
// InteractionController
// ---------------------------------------------------------------------------

/// Create with [`InteractionController::new`], then spawn
/// [`run`](Self::run) on the tokio runtime.
///
/// ```rust,no_run
/// use mirror_voice::config::AssistantConfig;
/// use mirror_voice::controller::{Collaborators, ControllerCommand, InteractionController};
///
/// # async fn example(collaborators: Collaborators) {
/// let (tx, rx) = tokio::sync::mpsc::channel(16);
/// let controller = InteractionController::new(AssistantConfig::default(), collaborators);
/// let task = tokio::spawn(controller.run(rx));
///
/// tx.send(ControllerCommand::Trigger).await.ok();
/// tx.send(ControllerCommand::Shutdown).await.ok();
/// task.await.ok();
/// # }
/// ```
pub struct InteractionController {
    config: AssistantConfig,
    source: Arc<dyn AudioSource>,
    converter: Arc<dyn ClipConverter>,
    transcriber: Arc<dyn TranscriptionClient>,
    orchestrator: Arc<ConversationOrchestrator>,
    speaker: Arc<dyn SpeechSynthesizer>,
    display: Arc<dyn DisplaySink>,
    matcher: WakeWordMatcher,
    recorder: Recorder,
    constraints: CaptureConstraints,

    state: InteractionState,
    epoch: u64,
    root: CancellationToken,
    scope: CancellationToken,
    watchdog: Option<CancellationToken>,
    watchdog_generation: u64,
    acquiring: Option<u64>,
    session: Option<Session>,
    segment: Option<SegmentHandle>,
    history: ConversationHistory,
    retries: RetryCounter,
    pending_input: Option<String>,
    notice: Option<String>,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Option<mpsc::UnboundedReceiver<Event>>,
}

impl InteractionController {
    pub fn new(config: AssistantConfig, collaborators: Collaborators) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let scope = root.child_token();
        Self {
            orchestrator: Arc::new(ConversationOrchestrator::new(collaborators.llm, &config.llm)),
            matcher: WakeWordMatcher::from_config(&config.wake),
            recorder: Recorder::new(config.audio.min_clip_bytes),
            constraints: CaptureConstraints::from_config(&config.audio),
            history: ConversationHistory::new(config.llm.max_history),
            source: collaborators.source,
            converter: collaborators.converter,
            transcriber: collaborators.transcriber,
            speaker: collaborators.speaker,
            display: collaborators.display,
            config,
            state: InteractionState::Initializing,
            epoch: 0,
            root,
            scope,
            watchdog: None,
            watchdog_generation: 0,
            acquiring: None,
            session: None,
            segment: None,
            retries: RetryCounter::new(),
            pending_input: None,
            notice: None,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    // -----------------------------------------------------------------------
    // Main async loop
    // -----------------------------------------------------------------------

    /// Run until [`ControllerCommand::Shutdown`] arrives or `commands` is
    /// closed.  The session is released on the way out.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ControllerCommand>) {
        let Some(mut events) = self.events_rx.take() else {
            return;
        };

        log::info!("controller: starting (wake phrase {:?})", self.matcher.phrase());
        self.enter_initializing().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ControllerCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        self.shutdown().await;
        log::info!("controller: stopped");
    }

    async fn handle_command(&mut self, command: ControllerCommand) {
        log::debug!("controller: {command:?} while {}", self.state);
        match command {
            ControllerCommand::Trigger => match self.state {
                InteractionState::WakeListening | InteractionState::ManualFallback => {
                    if self.has_live_session() {
                        self.enter_recording().await;
                    } else {
                        self.request_acquire(AcquireIntent::Manual);
                    }
                }
                InteractionState::Recording => self.stop_recording(),
                other => log::debug!("controller: trigger ignored while {other}"),
            },
            ControllerCommand::StopRecording => self.stop_recording(),
            ControllerCommand::Sleep => {
                if self.state == InteractionState::Recording {
                    // The clip event carries this epoch and goes stale on the next transition.
                    self.close_segment().await;
                    log::info!("controller: command recording abandoned");
                    self.return_to_listening().await;
                }
            }
            ControllerCommand::Suspend => {
                self.close_segment().await;
                self.release_session();
                self.notice = Some("Microphone off. Click to talk.".into());
                self.transition(InteractionState::ManualFallback).await;
            }
            ControllerCommand::Resume => {
                self.retries.clear_all();
                self.notice = None;
                self.enter_initializing().await;
            }
            ControllerCommand::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: Event) {
        if let Some(ticket) = event.ticket() {
            if ticket != self.epoch {
                log::debug!("controller: dropping stale {} while {}", event.name(), self.state);
                return;
            }
        }

        match event {
            Event::Acquired { intent, result, .. } => self.on_acquired(intent, result).await,
            Event::SourceFailed { detail, .. } => {
                self.acquiring = None;
                self.enter_error(format!("Microphone source failed: {detail}")).await;
            }
            Event::WakeChunk { result, .. } => self.on_wake_chunk(result).await,
            Event::RestartWake { .. } => {
                if self.state == InteractionState::WakeListening && self.segment.is_none() {
                    self.start_wake_chunk().await;
                }
            }
            Event::CommandClip { outcome, .. } => self.on_command_clip(outcome).await,
            Event::CommandTranscript { result, .. } => self.on_command_transcript(result).await,
            Event::Reply { result, .. } => self.on_reply(result).await,
            Event::SpeechDone { result, .. } => {
                if let Err(e) = result {
                    log::warn!("controller: speech failed: {e}");
                }
                self.return_to_listening().await;
            }
            Event::Watchdog { generation } => {
                if generation == self.watchdog_generation && self.state.is_watched() {
                    log::warn!(
                        "controller: no answer within {:?} while {}, returning to listening",
                        self.config.display.timeout(),
                        self.state
                    );
                    self.return_to_listening().await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Close any open segment, cancel the old scope, move to `next` and
    /// publish it.
    async fn transition(&mut self, next: InteractionState) {
        self.close_segment().await;
        self.scope.cancel();
        self.scope = self.root.child_token();
        self.epoch += 1;
        if !next.is_watched() {
            self.cancel_watchdog();
        }
        if self.state != next {
            log::debug!("controller: {} → {}", self.state, next);
        }
        self.state = next;
        self.publish();
    }

    async fn enter_initializing(&mut self) {
        self.transition(InteractionState::Initializing).await;
        if self.has_live_session() {
            self.enter_wake_listening(Duration::ZERO).await;
        } else {
            self.request_acquire(AcquireIntent::Automatic);
        }
    }

    async fn enter_wake_listening(&mut self, delay: Duration) {
        self.transition(InteractionState::WakeListening).await;
        if delay.is_zero() {
            self.start_wake_chunk().await;
        } else {
            self.schedule_wake_restart(delay);
        }
    }

    async fn enter_manual_fallback(&mut self, notice: Option<String>) {
        if notice.is_some() {
            self.notice = notice;
        }
        self.transition(InteractionState::ManualFallback).await;
    }

    async fn enter_error(&mut self, reason: String) {
        log::error!("controller: {reason}");
        self.close_segment().await;
        self.release_session();
        self.notice = Some(reason);
        self.transition(InteractionState::Error).await;
    }

    /// Leave an interaction.  Goes to ManualFallback when automatic listening
    /// is disabled or the microphone is gone.
    async fn return_to_listening(&mut self) {
        self.pending_input = None;
        self.cancel_watchdog();
        if !self.has_live_session() || self.retries.any_tripped() {
            self.enter_manual_fallback(None).await;
        } else {
            self.enter_wake_listening(self.config.audio.resume_delay()).await;
        }
    }

    // -----------------------------------------------------------------------
    // Microphone
    // -----------------------------------------------------------------------

    fn request_acquire(&mut self, intent: AcquireIntent) {
        if self.acquiring == Some(self.epoch) {
            log::debug!("controller: acquisition already in progress");
            return;
        }
        self.acquiring = Some(self.epoch);

        let ticket = self.epoch;
        let source = Arc::clone(&self.source);
        let constraints = self.constraints;
        let budget = self.config.audio.acquire_timeout();
        log::debug!("controller: acquiring microphone ({intent:?})");
        self.spawn_step(async move {
            match acquire_within(source, constraints, budget).await {
                Ok(result) => Event::Acquired {
                    ticket,
                    intent,
                    result,
                },
                Err(e) => Event::SourceFailed {
                    ticket,
                    detail: e.to_string(),
                },
            }
        });
    }

    async fn on_acquired(&mut self, intent: AcquireIntent, result: Result<Session, AcquisitionError>) {
        self.acquiring = None;
        match result {
            Ok(session) => {
                log::info!("controller: microphone session {} open", session.id());
                self.retries.record_success(FailureClass::Acquisition);
                self.release_session();
                self.session = Some(session);
                match intent {
                    AcquireIntent::Manual => self.enter_recording().await,
                    AcquireIntent::Automatic if self.retries.any_tripped() => {
                        self.enter_manual_fallback(None).await
                    }
                    AcquireIntent::Automatic => self.enter_wake_listening(Duration::ZERO).await,
                }
            }
            Err(e) => {
                let ceiling = self.config.retry.ceiling;
                let failures = self.retries.record_failure(FailureClass::Acquisition, ceiling);
                log::warn!("controller: {e} ({failures}/{ceiling})");
                if self.retries.is_tripped(FailureClass::Acquisition) {
                    log::warn!("controller: automatic listening disabled until resumed");
                }
                let notice = format!("Microphone unavailable: {}. Click to talk.", e.reason);
                self.enter_manual_fallback(Some(notice)).await;
            }
        }
    }

    fn has_live_session(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_released())
    }

    fn release_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            self.source.release(&mut session);
        }
    }

    /// Stop the open segment, if any, and wait briefly for it to finish.
    async fn close_segment(&mut self) {
        let Some(segment) = self.segment.take() else {
            return;
        };
        if !segment.is_open() {
            return;
        }
        segment.request_stop();
        if timeout(STOP_WAIT, segment.finished()).await.is_err() {
            log::warn!(
                "controller: segment {} did not stop within {STOP_WAIT:?}, detaching",
                segment.id()
            );
            if let Some(session) = &self.session {
                session.tap().force_detach();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Wake loop
    // -----------------------------------------------------------------------

    async fn start_wake_chunk(&mut self) {
        if !self.has_live_session() {
            self.enter_manual_fallback(Some("Microphone stopped. Click to talk.".into()))
                .await;
            return;
        }

        let started = match &self.session {
            Some(session) => self.recorder.start_segment(session, self.config.audio.wake_chunk()),
            None => Err(RecorderError::SessionReleased),
        };
        match started {
            Ok(segment) => {
                self.segment = Some(segment.clone());
                let ticket = self.epoch;
                let converter = Arc::clone(&self.converter);
                let transcriber = Arc::clone(&self.transcriber);
                self.spawn_step(async move {
                    let result = match segment.finished().await {
                        Ok(clip) => {
                            transcribe_clip(&clip, converter, transcriber, ClipPurpose::WakeWord).await
                        }
                        Err(e) => Err(e.into()),
                    };
                    Event::WakeChunk { ticket, result }
                });
            }
            Err(e) => self.on_wake_failure(e.into()).await,
        }
    }

    fn schedule_wake_restart(&self, delay: Duration) {
        let ticket = self.epoch;
        self.spawn_step(async move {
            sleep(delay).await;
            Event::RestartWake { ticket }
        });
    }

    async fn on_wake_chunk(&mut self, result: Result<String, StepError>) {
        self.segment = None;
        match result {
            Ok(text) => {
                self.retries.record_success(FailureClass::WakeWord);
                if !text.is_empty() {
                    if self.config.debug {
                        log::info!("controller: wake loop heard {text:?}");
                    } else {
                        log::debug!("controller: wake loop heard {text:?}");
                    }
                }
                if self.matcher.matches(&text) {
                    log::info!("controller: wake phrase detected");
                    self.enter_recording().await;
                } else {
                    self.start_wake_chunk().await;
                }
            }
            Err(StepError::Silence) => self.start_wake_chunk().await,
            Err(e) => self.on_wake_failure(e).await,
        }
    }

    async fn on_wake_failure(&mut self, error: StepError) {
        let ceiling = self.config.retry.ceiling;
        let failures = self.retries.record_failure(FailureClass::WakeWord, ceiling);
        if self.retries.is_tripped(FailureClass::WakeWord) {
            log::warn!("controller: wake loop failed {failures} times ({error}), switching to manual mode");
            self.enter_manual_fallback(Some("Voice activation paused. Click to talk.".into()))
                .await;
        } else {
            let backoff = self.config.retry.backoff_for(failures);
            log::warn!("controller: wake chunk failed ({failures}/{ceiling}): {error}; retrying in {backoff:?}");
            self.schedule_wake_restart(backoff);
        }
    }

    // -----------------------------------------------------------------------
    // Command
    // -----------------------------------------------------------------------

    async fn enter_recording(&mut self) {
        self.notice = None;
        // Closes the wake segment and cancels its restart timer first.
        self.transition(InteractionState::Recording).await;

        let started = match &self.session {
            Some(session) => self.recorder.start_segment(session, self.config.audio.recording()),
            None => Err(RecorderError::SessionReleased),
        };
        match started {
            Ok(segment) => {
                log::info!("controller: recording command (segment {})", segment.id());
                self.segment = Some(segment.clone());
                let ticket = self.epoch;
                self.spawn_step(async move {
                    let outcome = segment.finished().await;
                    Event::CommandClip { ticket, outcome }
                });
            }
            Err(e) => self.on_command_failure(e.into()).await,
        }
    }

    fn stop_recording(&self) {
        if self.state != InteractionState::Recording {
            return;
        }
        if let Some(segment) = &self.segment {
            log::debug!("controller: stopping segment {} early", segment.id());
            segment.request_stop();
        }
    }

    async fn on_command_clip(&mut self, outcome: SegmentOutcome) {
        self.segment = None;
        let clip = match outcome {
            Ok(clip) => {
                log::debug!(
                    "controller: command clip {:.1}s, {} bytes",
                    clip.duration_hint().as_secs_f32(),
                    clip.byte_len()
                );
                clip
            }
            Err(e) => {
                match StepError::from(e) {
                    StepError::Silence => {
                        log::debug!("controller: command clip was empty");
                        self.return_to_listening().await;
                    }
                    other => self.on_command_failure(other).await,
                }
                return;
            }
        };

        self.transition(InteractionState::Transcribing).await;
        let ticket = self.epoch;
        let converter = Arc::clone(&self.converter);
        let transcriber = Arc::clone(&self.transcriber);
        self.spawn_step(async move {
            let result = transcribe_clip(&clip, converter, transcriber, ClipPurpose::Command).await;
            Event::CommandTranscript { ticket, result }
        });
    }

    async fn on_command_transcript(&mut self, result: Result<String, StepError>) {
        match result {
            Ok(text) if !text.is_empty() => {
                self.retries.record_success(FailureClass::Recording);
                log::info!("controller: heard {text:?}");
                self.pending_input = Some(text.clone());
                self.enter_querying(text).await;
            }
            Ok(_) | Err(StepError::Silence) => {
                log::debug!("controller: no command heard");
                self.return_to_listening().await;
            }
            Err(e) => self.on_command_failure(e).await,
        }
    }

    async fn on_command_failure(&mut self, error: StepError) {
        let ceiling = self.config.retry.ceiling;
        let failures = self.retries.record_failure(FailureClass::Recording, ceiling);
        log::warn!("controller: command failed ({failures}/{ceiling}): {error}");
        if self.retries.is_tripped(FailureClass::Recording) {
            self.notice = Some("Voice commands keep failing. Click to talk.".into());
        }
        self.return_to_listening().await;
    }

    // -----------------------------------------------------------------------
    // Reply
    // -----------------------------------------------------------------------

    async fn enter_querying(&mut self, text: String) {
        self.transition(InteractionState::Querying).await;
        self.start_watchdog();

        let ticket = self.epoch;
        let orchestrator = Arc::clone(&self.orchestrator);
        let history = self.history.clone();
        let system_prompt = self.config.llm.system_prompt.clone();
        self.spawn_step(async move {
            let result = orchestrator.ask(&history, &text, &system_prompt).await;
            Event::Reply { ticket, result }
        });
    }

    async fn on_reply(&mut self, result: Result<String, LlmError>) {
        match result {
            Ok(reply) => {
                let user = self.pending_input.take().unwrap_or_default();
                self.history.push(ConversationTurn::new(user, Some(reply.clone())));
                self.enter_speaking(reply).await;
            }
            Err(e) => {
                log::warn!("controller: {e}");
                let apology = e.apology().to_string();
                self.notice = Some(apology.clone());
                if self.config.speech.enabled {
                    self.enter_speaking(apology).await;
                } else {
                    self.return_to_listening().await;
                }
            }
        }
    }

    async fn enter_speaking(&mut self, text: String) {
        self.transition(InteractionState::Speaking).await;
        if !self.config.speech.enabled {
            self.return_to_listening().await;
            return;
        }
        self.start_watchdog();

        let ticket = self.epoch;
        let speaker = Arc::clone(&self.speaker);
        let utterance = Utterance {
            text,
            language: self.config.language.clone(),
            rate: self.config.speech.rate,
            pitch: self.config.speech.pitch,
        };
        self.spawn_step(async move {
            let result = speaker.speak(&utterance).await;
            Event::SpeechDone { ticket, result }
        });
    }

    fn start_watchdog(&mut self) {
        self.cancel_watchdog();
        self.watchdog_generation += 1;
        let generation = self.watchdog_generation;
        let token = self.root.child_token();
        self.watchdog = Some(token.clone());

        let tx = self.events_tx.clone();
        let bound = self.config.display.timeout();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(bound) => {
                    let _ = tx.send(Event::Watchdog { generation });
                }
            }
        });
    }

    fn cancel_watchdog(&mut self) {
        if let Some(token) = self.watchdog.take() {
            token.cancel();
        }
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    /// Run `step` in the current scope and deliver its event.  A scope
    /// cancellation drops the future, aborting whatever it was waiting on.
    fn spawn_step<F>(&self, step: F)
    where
        F: Future<Output = Event> + Send + 'static,
    {
        let tx = self.events_tx.clone();
        let scope = self.scope.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {}
                event = step => {
                    let _ = tx.send(event);
                }
            }
        });
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state,
            status_text: self.state.status_text(self.matcher.phrase()),
            recent_history: self.history.recent(DISPLAYED_TURNS),
            pending_input: self.pending_input.clone(),
            notice: self.notice.clone(),
            failures: self.retries.clone(),
        }
    }

    fn publish(&self) {
        self.display.update(&self.snapshot());
    }

    async fn shutdown(&mut self) {
        self.close_segment().await;
        self.cancel_watchdog();
        self.root.cancel();
        self.release_session();
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Open the microphone on the blocking pool.  A session that arrives after
/// the budget is dropped, which releases it.  The outer `Err` means the
/// source panicked.
async fn acquire_within(
    source: Arc<dyn AudioSource>,
    constraints: CaptureConstraints,
    budget: Duration,
) -> Result<Result<Session, AcquisitionError>, JoinError> {
    let task = tokio::task::spawn_blocking(move || source.acquire(&constraints));
    match timeout(budget, task).await {
        Ok(joined) => joined,
        Err(_) => Ok(Err(AcquisitionError::new(
            AcquisitionReason::Timeout,
            format!("no microphone after {budget:?}"),
        ))),
    }
}

async fn transcribe_clip(
    clip: &Clip,
    converter: Arc<dyn ClipConverter>,
    transcriber: Arc<dyn TranscriptionClient>,
    purpose: ClipPurpose,
) -> Result<String, StepError> {
    let canonical = converter.to_canonical(clip).await?;
    let text = transcriber.transcribe(&canonical, purpose).await?;
    Ok(text.trim().to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{
        fast_config, states, CountingConverter, FakeSource, Harness, HangingLlm,
        RecordingDisplay, RecordingSpeaker, ScriptedLlm, ScriptedTranscriber,
    };
    use crate::llm::ChatClient;
    use crate::test_support::{serve, StubResponse};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    use InteractionState::{ManualFallback, Querying, Recording, Speaking, Transcribing, WakeListening};

    /// `true` when `first` appears and `then` appears somewhere after it.
    fn reached(snapshots: &[StatusSnapshot], first: InteractionState, then: InteractionState) -> bool {
        snapshots
            .iter()
            .position(|s| s.state == first)
            .is_some_and(|i| snapshots[i + 1..].iter().any(|s| s.state == then))
    }

    #[test]
    fn step_errors_classify_silence() {
        assert_eq!(
            StepError::from(RecorderError::EmptyClip { bytes: 0 }),
            StepError::Silence
        );
        assert_eq!(StepError::from(ConversionError::EmptyAudio), StepError::Silence);
        assert_eq!(
            StepError::from(RecorderError::SegmentBusy),
            StepError::Recorder(RecorderError::SegmentBusy)
        );
    }

    #[tokio::test]
    async fn empty_command_clip_returns_to_listening_uncounted() {
        let source = FakeSource::silent();
        let converter = CountingConverter::ok();
        let transcriber = ScriptedTranscriber::new(vec![], Ok(String::new()), Ok("unused".into()));
        let mut harness = Harness::start(
            fast_config(),
            source.clone(),
            converter.clone(),
            transcriber.clone(),
            ScriptedLlm::ok("unused"),
            RecordingSpeaker::new(),
        );

        harness.wait_for(|s| s.last().is_some_and(|s| s.state == WakeListening)).await;
        harness.send(ControllerCommand::Trigger).await;
        let snapshots = harness.wait_for(|s| reached(s, Recording, WakeListening)).await;

        assert_eq!(converter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(transcriber.command_calls.load(Ordering::SeqCst), 0);
        assert!(snapshots.iter().all(|s| s.failures == RetryCounter::default()));
        assert!(!states(&snapshots).contains(&Transcribing));
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn wake_phrase_leads_to_spoken_reply_and_history() {
        let source = FakeSource::feeding();
        let transcriber = ScriptedTranscriber::new(
            vec![Ok("just some noise".into()), Ok("Hello Mirror".into())],
            Ok(String::new()),
            Ok("what time is it".into()),
        );
        let speaker = RecordingSpeaker::new();
        let mut harness = Harness::start(
            fast_config(),
            source,
            CountingConverter::ok(),
            transcriber.clone(),
            ScriptedLlm::ok("**It is noon.**"),
            speaker.clone(),
        );

        let snapshots = harness.wait_for(|s| reached(s, Speaking, WakeListening)).await;

        let seen = states(&snapshots);
        let order = [WakeListening, Recording, Transcribing, Querying, Speaking];
        let positions: Vec<usize> = order
            .iter()
            .map(|st| seen.iter().position(|s| s == st).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{seen:?}");

        assert_eq!(speaker.spoken(), vec!["It is noon.".to_string()]);
        let turns = &snapshots.last().unwrap().recent_history;
        assert_eq!(
            turns,
            &vec![ConversationTurn::new("what time is it", Some("It is noon.".into()))]
        );
        // A second open segment would have failed the command recording.
        assert!(snapshots.iter().all(|s| s.failures.count(FailureClass::Recording) == 0));
        assert_eq!(transcriber.command_calls.load(Ordering::SeqCst), 1);
        assert!(transcriber.wake_calls.load(Ordering::SeqCst) >= 2);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_wake_failures_switch_to_manual_until_resumed() {
        let transcriber = ScriptedTranscriber::new(
            vec![],
            Err(TranscriptionError::Refused),
            Ok(String::new()),
        );
        let mut harness = Harness::start(
            fast_config(),
            FakeSource::feeding(),
            CountingConverter::ok(),
            transcriber.clone(),
            ScriptedLlm::ok("unused"),
            RecordingSpeaker::new(),
        );

        let snapshots = harness
            .wait_for(|s| s.last().is_some_and(|s| s.state == ManualFallback))
            .await;
        let last = snapshots.last().unwrap();
        assert!(last.failures.is_tripped(FailureClass::WakeWord));
        assert_eq!(last.status_text, "Click to talk");
        assert!(last.notice.is_some());
        assert_eq!(transcriber.wake_calls.load(Ordering::SeqCst), 5);

        // No automatic restarts once tripped.
        sleep(Duration::from_millis(150)).await;
        assert_eq!(transcriber.wake_calls.load(Ordering::SeqCst), 5);

        // A manual command still works, and the loop stays disabled.
        let before = harness.len();
        harness.send(ControllerCommand::Trigger).await;
        let snapshots = harness
            .wait_for(|s| reached(&s[before..], Recording, ManualFallback))
            .await;
        assert!(snapshots.last().unwrap().failures.is_tripped(FailureClass::WakeWord));
        assert_eq!(transcriber.wake_calls.load(Ordering::SeqCst), 5);

        let before = harness.len();
        harness.send(ControllerCommand::Resume).await;
        let snapshots = harness
            .wait_for(|s| s[before..].iter().any(|s| s.state == WakeListening))
            .await;
        assert!(!snapshots[before..]
            .iter()
            .find(|s| s.state == WakeListening)
            .unwrap()
            .failures
            .any_tripped());
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn acquisition_failures_stay_in_manual_mode_past_the_ceiling() {
        let source = FakeSource::failing(AcquisitionReason::NoDevice);
        let mut harness = Harness::start(
            fast_config(),
            source.clone(),
            CountingConverter::ok(),
            ScriptedTranscriber::new(vec![], Ok(String::new()), Ok(String::new())),
            ScriptedLlm::ok("unused"),
            RecordingSpeaker::new(),
        );

        let snapshots = harness
            .wait_for(|s| s.last().is_some_and(|s| s.state == ManualFallback))
            .await;
        let last = snapshots.last().unwrap();
        assert_eq!(last.failures.count(FailureClass::Acquisition), 1);
        assert!(last.notice.as_deref().unwrap().contains("no device"));

        for n in 2..=5 {
            harness.send(ControllerCommand::Trigger).await;
            harness
                .wait_for(|s| {
                    s.last()
                        .is_some_and(|s| s.failures.count(FailureClass::Acquisition) == n)
                })
                .await;
        }
        let snapshots = harness.wait_for(|_| true).await;
        let last = snapshots.last().unwrap();
        assert_eq!(last.state, ManualFallback);
        assert!(last.failures.is_tripped(FailureClass::Acquisition));
        assert_eq!(source.acquisitions(), 5);

        // Click to talk keeps retrying the microphone.
        harness.send(ControllerCommand::Trigger).await;
        let snapshots = harness
            .wait_for(|s| {
                s.last()
                    .is_some_and(|s| s.failures.count(FailureClass::Acquisition) == 6)
            })
            .await;
        assert_eq!(snapshots.last().unwrap().state, ManualFallback);
        assert_eq!(source.acquisitions(), 6);
        assert!(snapshots.iter().all(|s| s.state != InteractionState::Error));
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn crashing_source_enters_error_until_resumed() {
        let source = FakeSource::panicking();
        let mut harness = Harness::start(
            fast_config(),
            source.clone(),
            CountingConverter::ok(),
            ScriptedTranscriber::new(vec![], Ok(String::new()), Ok(String::new())),
            ScriptedLlm::ok("unused"),
            RecordingSpeaker::new(),
        );

        let snapshots = harness
            .wait_for(|s| s.last().is_some_and(|s| s.state == InteractionState::Error))
            .await;
        let last = snapshots.last().unwrap();
        assert_eq!(last.status_text, "Voice assistant unavailable");
        assert!(last.notice.as_deref().unwrap().contains("source failed"));
        assert_eq!(source.acquisitions(), 1);

        // Error ignores triggers.
        harness.send(ControllerCommand::Trigger).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(source.acquisitions(), 1);

        let before = harness.len();
        harness.send(ControllerCommand::Resume).await;
        harness
            .wait_for(|s| s[before..].iter().any(|s| s.state == InteractionState::Error))
            .await;
        assert_eq!(source.acquisitions(), 2);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn empty_choices_speak_the_malformed_apology() {
        let (url, server) = serve(vec![StubResponse::json(200, json!({ "choices": [] }))]).await;
        let mut config = fast_config();
        config.llm.endpoint = format!("{url}/v1/chat/completions");
        let llm = Arc::new(ChatClient::from_config(&config.llm));

        let speaker = RecordingSpeaker::new();
        let mut harness = Harness::start(
            config,
            FakeSource::feeding(),
            CountingConverter::ok(),
            ScriptedTranscriber::new(
                vec![Ok("hello mirror".into())],
                Ok(String::new()),
                Ok("tell me a joke".into()),
            ),
            llm,
            speaker.clone(),
        );

        let snapshots = harness.wait_for(|s| reached(s, Speaking, WakeListening)).await;
        let apology = LlmError::MalformedResponse(String::new()).apology();
        assert_eq!(speaker.spoken(), vec![apology.to_string()]);
        let last = snapshots.last().unwrap();
        assert!(last.recent_history.is_empty());
        assert_eq!(last.notice.as_deref(), Some(apology));
        assert_eq!(server.await.unwrap().len(), 1);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn llm_failure_without_speech_is_displayed() {
        let mut config = fast_config();
        config.speech.enabled = false;
        let speaker = RecordingSpeaker::new();
        let mut harness = Harness::start(
            config,
            FakeSource::feeding(),
            CountingConverter::ok(),
            ScriptedTranscriber::new(vec![Ok("hello mirror".into())], Ok(String::new()), Ok("hi".into())),
            ScriptedLlm::err(LlmError::Timeout),
            speaker.clone(),
        );

        let snapshots = harness.wait_for(|s| reached(s, Querying, WakeListening)).await;
        assert_eq!(
            snapshots.last().unwrap().notice.as_deref(),
            Some(LlmError::Timeout.apology())
        );
        assert!(speaker.spoken().is_empty());
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn watchdog_returns_to_listening_when_llm_hangs() {
        let mut config = fast_config();
        config.display.timeout_ms = 100;
        let speaker = RecordingSpeaker::new();
        let mut harness = Harness::start(
            config,
            FakeSource::feeding(),
            CountingConverter::ok(),
            ScriptedTranscriber::new(vec![Ok("hello mirror".into())], Ok(String::new()), Ok("hi".into())),
            Arc::new(HangingLlm),
            speaker.clone(),
        );

        let snapshots = harness.wait_for(|s| reached(s, Querying, WakeListening)).await;
        assert!(!states(&snapshots).contains(&Speaking));
        assert!(snapshots.last().unwrap().recent_history.is_empty());
        assert!(speaker.spoken().is_empty());
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn watchdog_is_rearmed_when_speech_starts() {
        let mut config = fast_config();
        config.display.timeout_ms = 300;
        let speaker = RecordingSpeaker::slow(Duration::from_millis(200));
        let mut harness = Harness::start(
            config,
            FakeSource::feeding(),
            CountingConverter::ok(),
            ScriptedTranscriber::new(vec![Ok("hello mirror".into())], Ok(String::new()), Ok("hi".into())),
            ScriptedLlm::slow("Hello there.", Duration::from_millis(200)),
            speaker.clone(),
        );

        // Each phase fits the bound; together they do not.
        harness.wait_for(|s| reached(s, Speaking, WakeListening)).await;
        assert_eq!(speaker.spoken(), vec!["Hello there.".to_string()]);
        assert_eq!(speaker.completed(), 1);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn speech_failure_returns_to_listening() {
        let speaker = RecordingSpeaker::failing(TtsError::Unavailable("espeak-ng not found".into()));
        let mut harness = Harness::start(
            fast_config(),
            FakeSource::feeding(),
            CountingConverter::ok(),
            ScriptedTranscriber::new(vec![Ok("hello mirror".into())], Ok(String::new()), Ok("hi".into())),
            ScriptedLlm::ok("Hello."),
            speaker.clone(),
        );

        let snapshots = harness.wait_for(|s| reached(s, Speaking, WakeListening)).await;
        assert_eq!(speaker.spoken(), vec!["Hello.".to_string()]);
        assert_eq!(speaker.completed(), 0);
        let last = snapshots.last().unwrap();
        assert_eq!(last.recent_history, vec![ConversationTurn::new("hi", Some("Hello.".into()))]);
        assert!(snapshots.iter().all(|s| s.failures == RetryCounter::default()));
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn stale_results_do_not_move_the_controller() {
        let (display, snapshots) = RecordingDisplay::new();
        let transcriber = ScriptedTranscriber::new(vec![], Ok(String::new()), Ok("unused".into()));
        let mut controller = InteractionController::new(
            fast_config(),
            Collaborators {
                source: FakeSource::silent(),
                converter: CountingConverter::ok(),
                transcriber: transcriber.clone(),
                llm: ScriptedLlm::ok("unused"),
                speaker: RecordingSpeaker::new(),
                display,
            },
        );
        controller.transition(Recording).await;
        let current = controller.epoch;
        let published = snapshots.borrow().len();

        let old = current - 1;
        controller
            .handle_event(Event::WakeChunk {
                ticket: old,
                result: Ok("hello mirror".into()),
            })
            .await;
        controller
            .handle_event(Event::CommandTranscript {
                ticket: old,
                result: Ok("lights on".into()),
            })
            .await;
        controller
            .handle_event(Event::Reply {
                ticket: old,
                result: Ok("Done.".into()),
            })
            .await;

        assert_eq!(controller.state, Recording);
        assert_eq!(controller.epoch, current);
        assert_eq!(snapshots.borrow().len(), published);
        assert!(controller.history.is_empty());
        assert!(controller.pending_input.is_none());
        assert_eq!(transcriber.command_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn late_wake_match_after_trigger_is_discarded() {
        let transcriber = ScriptedTranscriber::slow_wake(
            Duration::from_millis(200),
            vec![Ok("hello mirror".into())],
            Ok(String::new()),
            Ok("lights on".into()),
        );
        let speaker = RecordingSpeaker::new();
        let mut harness = Harness::start(
            fast_config(),
            FakeSource::feeding(),
            CountingConverter::ok(),
            transcriber.clone(),
            ScriptedLlm::ok("Done."),
            speaker.clone(),
        );

        // The first wake chunk is being transcribed when the trigger lands.
        timeout(Duration::from_secs(2), async {
            while transcriber.wake_calls.load(Ordering::SeqCst) == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("wake chunk transcribed");
        harness.send(ControllerCommand::Trigger).await;
        harness.wait_for(|s| reached(s, Speaking, WakeListening)).await;

        // Well past the moment the wake match would have been delivered.
        sleep(Duration::from_millis(300)).await;
        let snapshots = harness.wait_for(|_| true).await;
        let recordings = snapshots.iter().filter(|s| s.state == Recording).count();
        assert_eq!(recordings, 1, "{:?}", states(&snapshots));
        assert_eq!(transcriber.command_calls.load(Ordering::SeqCst), 1);
        assert_eq!(speaker.spoken(), vec!["Done.".to_string()]);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn stop_request_ends_recording_early() {
        let mut config = fast_config();
        config.audio.recording_ms = 60_000;
        let transcriber = ScriptedTranscriber::new(vec![], Ok(String::new()), Ok("lights on".into()));
        let mut harness = Harness::start(
            config,
            FakeSource::feeding(),
            CountingConverter::ok(),
            transcriber.clone(),
            ScriptedLlm::ok("Done."),
            RecordingSpeaker::new(),
        );

        harness.wait_for(|s| s.last().is_some_and(|s| s.state == WakeListening)).await;
        harness.send(ControllerCommand::Trigger).await;
        harness.wait_for(|s| s.last().is_some_and(|s| s.state == Recording)).await;
        sleep(Duration::from_millis(50)).await;
        harness.send(ControllerCommand::StopRecording).await;

        harness.wait_for(|s| reached(s, Speaking, WakeListening)).await;
        assert_eq!(transcriber.command_calls.load(Ordering::SeqCst), 1);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn sleep_discards_the_command_clip() {
        let mut config = fast_config();
        config.audio.recording_ms = 60_000;
        let transcriber = ScriptedTranscriber::new(vec![], Ok(String::new()), Ok("lights on".into()));
        let mut harness = Harness::start(
            config,
            FakeSource::feeding(),
            CountingConverter::ok(),
            transcriber.clone(),
            ScriptedLlm::ok("Done."),
            RecordingSpeaker::new(),
        );

        harness.wait_for(|s| s.last().is_some_and(|s| s.state == WakeListening)).await;
        harness.send(ControllerCommand::Trigger).await;
        harness.wait_for(|s| s.last().is_some_and(|s| s.state == Recording)).await;
        harness.send(ControllerCommand::Sleep).await;

        let snapshots = harness.wait_for(|s| reached(s, Recording, WakeListening)).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(transcriber.command_calls.load(Ordering::SeqCst), 0);
        assert!(!states(&snapshots).contains(&Transcribing));

        // The abandoned segment is closed, so a new recording opens cleanly.
        let before = harness.len();
        harness.send(ControllerCommand::Trigger).await;
        let snapshots = harness
            .wait_for(|s| s[before..].iter().any(|s| s.state == Recording))
            .await;
        assert!(snapshots.iter().all(|s| s.failures.count(FailureClass::Recording) == 0));
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn suspend_releases_and_trigger_reacquires() {
        let source = FakeSource::feeding();
        let mut harness = Harness::start(
            fast_config(),
            source.clone(),
            CountingConverter::ok(),
            ScriptedTranscriber::new(vec![], Ok(String::new()), Ok(String::new())),
            ScriptedLlm::ok("unused"),
            RecordingSpeaker::new(),
        );

        harness.wait_for(|s| s.last().is_some_and(|s| s.state == WakeListening)).await;
        harness.send(ControllerCommand::Suspend).await;
        harness.wait_for(|s| s.last().is_some_and(|s| s.state == ManualFallback)).await;
        assert_eq!(source.releases(), 1);

        harness.send(ControllerCommand::Trigger).await;
        harness.wait_for(|s| s.last().is_some_and(|s| s.state == Recording)).await;
        assert_eq!(source.acquisitions(), 2);

        harness.shutdown().await;
        assert_eq!(source.releases(), 2);
    }
}
