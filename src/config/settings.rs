//! Assistant settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and handed to the
//! controller by value.  Every section is `#[serde(default)]`, so a partial
//! `settings.toml` only needs the keys that differ from the defaults.
//!
//! Durations are stored as integer milliseconds and exposed through
//! `Duration` accessors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Directory name under the platform config and data directories.
const APP_DIR: &str = "mirror-voice";

/// `settings.toml` in the platform config directory, e.g.
/// `~/.config/mirror-voice/settings.toml` on Linux.  Falls back to the
/// current directory when the platform has no config directory.
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("settings.toml")
}

/// Where bare Whisper model names are looked up, e.g.
/// `~/.local/share/mirror-voice/models` on Linux.
pub fn models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("models")
}

// ---------------------------------------------------------------------------
// WakeConfig
// ---------------------------------------------------------------------------

/// Wake phrase and the fallback tokens that also count as a wake match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Phrase that switches the assistant from passive listening to command
    /// capture (matched case-insensitively as a substring).
    pub phrase: String,
    /// Extra tokens accepted as a wake match, to tolerate partial or garbled
    /// transcriptions of multi-word phrases.
    pub fallback_tokens: Vec<String>,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            phrase: "hello mirror".into(),
            fallback_tokens: vec!["mirror".into(), "hey mirror".into(), "hello".into()],
        }
    }
}

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Microphone, segment and conversion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Length of one wake-word chunk in milliseconds.
    pub wake_chunk_ms: u64,
    /// Upper bound of a command recording in milliseconds.
    pub recording_ms: u64,
    /// Clips smaller than this many bytes (header included) are reported as
    /// empty rather than handed to the converter.
    pub min_clip_bytes: usize,
    /// Maximum wait for the microphone to open.
    pub acquire_timeout_ms: u64,
    /// Pause before the wake loop resumes after an interaction.
    pub resume_delay_ms: u64,
    /// Time budget for decoding one clip.
    pub decode_timeout_ms: u64,
    /// Capture-rate hint passed to the audio source.
    pub preferred_sample_rate: u32,
    /// Echo-cancellation hint passed to the audio source.
    pub echo_cancellation: bool,
    /// Noise-suppression hint passed to the audio source.
    pub noise_suppression: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            wake_chunk_ms: 3_000,
            recording_ms: 10_000,
            min_clip_bytes: 1_024,
            acquire_timeout_ms: 5_000,
            resume_delay_ms: 500,
            decode_timeout_ms: 5_000,
            preferred_sample_rate: 16_000,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

impl AudioConfig {
    pub fn wake_chunk(&self) -> Duration {
        Duration::from_millis(self.wake_chunk_ms)
    }

    pub fn recording(&self) -> Duration {
        Duration::from_millis(self.recording_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn resume_delay(&self) -> Duration {
        Duration::from_millis(self.resume_delay_ms)
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_millis(self.decode_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// TranscriptionConfig
// ---------------------------------------------------------------------------

/// Selects which transcription backend handles wake chunks and commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionBackend {
    /// HTTP transcription service (`POST <endpoint>/transcribe`).
    Http,
    /// In-process Whisper inference (cargo feature `whisper`).
    Whisper,
}

impl Default for TranscriptionBackend {
    fn default() -> Self {
        Self::Http
    }
}

/// Settings for the transcription collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub backend: TranscriptionBackend,
    /// Base URL of the transcription service.
    pub endpoint: String,
    /// Request timeout for wake-word chunks (short).
    pub wake_timeout_ms: u64,
    /// Request timeout for command clips (longer).
    pub command_timeout_ms: u64,
    /// Base URL of the remote conversion service, used only for containers
    /// the local decoder cannot handle.  `None` disables the fallback.
    pub conversion_endpoint: Option<String>,
    /// GGML model for the Whisper backend: a path, or a file name inside
    /// [`models_dir`].
    pub whisper_model: Option<String>,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            backend: TranscriptionBackend::default(),
            endpoint: "http://localhost:5000".into(),
            wake_timeout_ms: 5_000,
            command_timeout_ms: 15_000,
            conversion_endpoint: None,
            whisper_model: None,
        }
    }
}

impl TranscriptionConfig {
    pub fn wake_timeout(&self) -> Duration {
        Duration::from_millis(self.wake_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// The configured Whisper model with bare file names resolved against
    /// [`models_dir`].
    pub fn whisper_model_path(&self) -> Option<PathBuf> {
        let name = self.whisper_model.as_deref()?;
        let path = Path::new(name);
        if path.is_absolute() || path.components().count() > 1 {
            Some(path.to_path_buf())
        } else {
            Some(models_dir().join(path))
        }
    }
}

// ---------------------------------------------------------------------------
// LlmConfig
// ---------------------------------------------------------------------------

/// Settings for the language-model endpoint and the conversation it sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Full URL of an OpenAI-compatible chat-completions endpoint.
    pub endpoint: String,
    /// API key: `None` for local servers.
    pub api_key: Option<String>,
    /// Model identifier sent with every request.  Local servers usually
    /// ignore it.
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Maximum time to wait for one completion.
    pub timeout_ms: u64,
    pub system_prompt: String,
    /// Number of exchanges kept in the conversation history.
    pub max_history: usize,
    /// Spoken replies are cut to at most this many sentences …
    pub max_reply_sentences: usize,
    /// … and at most this many characters.
    pub max_reply_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:1234/v1/chat/completions".into(),
            api_key: None,
            model: "gpt-3.5-turbo".into(),
            temperature: 0.7,
            max_tokens: 150,
            timeout_ms: 30_000,
            system_prompt: "You are a helpful voice assistant for a smart mirror. \
                            Keep responses concise and conversational."
                .into(),
            max_history: 5,
            max_reply_sentences: 3,
            max_reply_chars: 300,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// SpeechConfig
// ---------------------------------------------------------------------------

/// Text-to-speech settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// When `false` every utterance completes immediately and apologies are
    /// only displayed.
    pub enabled: bool,
    /// Speech program invoked for each utterance.
    pub program: String,
    /// Relative speaking rate (1.0 = normal).
    pub rate: f32,
    /// Relative pitch (1.0 = normal).
    pub pitch: f32,
    /// Upper bound on a single utterance.
    pub timeout_ms: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "espeak-ng".into(),
            rate: 0.9,
            pitch: 1.0,
            timeout_ms: 30_000,
        }
    }
}

impl SpeechConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// DisplayConfig
// ---------------------------------------------------------------------------

/// Status display settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub enabled: bool,
    /// Watchdog bound on Querying + Speaking: if no terminal event arrives
    /// in time the controller returns to listening.
    pub timeout_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 10_000,
        }
    }
}

impl DisplayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

/// Failure ceiling and backoff for the automatic loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Consecutive failures of one class that switch to manual mode.
    pub ceiling: u32,
    /// Delay before the first retry of the wake loop.
    pub backoff_ms: u64,
    /// Cap for the exponential backoff.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            ceiling: 5,
            backoff_ms: 1_000,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryConfig {
    /// Backoff before the next wake chunk after `failures` consecutive
    /// failures: `backoff * 2^(failures-1)`, capped.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let shift = (failures - 1).min(16);
        let ms = self.backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

// ---------------------------------------------------------------------------
// AssistantConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// Loaded once at startup and passed to the controller by value; there is
/// no hot reload.
///
/// ```rust,no_run
/// use mirror_voice::config::AssistantConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AssistantConfig::load().unwrap();
/// assert!(!config.wake.phrase.is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// BCP-47 language tag used for speech synthesis (e.g. `"en-US"`).
    pub language: String,
    /// Verbose logging, including every wake-chunk transcript.
    pub debug: bool,
    pub wake: WakeConfig,
    pub audio: AudioConfig,
    pub transcription: TranscriptionConfig,
    pub llm: LlmConfig,
    pub speech: SpeechConfig,
    pub display: DisplayConfig,
    pub retry: RetryConfig,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            language: "en-US".into(),
            debug: false,
            wake: WakeConfig::default(),
            audio: AudioConfig::default(),
            transcription: TranscriptionConfig::default(),
            llm: LlmConfig::default(),
            speech: SpeechConfig::default(),
            display: DisplayConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl AssistantConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AssistantConfig::default())` when the file does not exist
    /// yet, so callers never need to special-case a missing file.
    pub fn load() -> Result<Self> {
        Self::load_from(&settings_path())
    }

    /// Load from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&settings_path())
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
