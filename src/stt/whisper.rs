//! In-process transcription with `whisper-rs` (cargo feature `whisper`).
//!
//! The model is loaded once; every call creates its own `WhisperState` on
//! the blocking pool, so the transcriber can be shared without locking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::client::{ClipPurpose, TranscriptionClient, TranscriptionError};
use crate::audio::CanonicalClip;
use crate::config::TranscriptionConfig;

/// Whisper refuses clips shorter than this (0.5 s at 16 kHz); they are
/// treated as silence.
const MIN_AUDIO_SAMPLES: usize = 8_000;

pub struct WhisperTranscriber {
    ctx: Arc<WhisperContext>,
    language: Option<String>,
    n_threads: i32,
    wake_timeout: Duration,
    command_timeout: Duration,
}

impl WhisperTranscriber {
    /// Load the GGML model named by `config.whisper_model`.  A bare file name
    /// is looked up in [`crate::config::models_dir`].
    ///
    /// `language` is a BCP-47 tag; only its primary subtag is passed to
    /// Whisper (`"en-US"` → `"en"`).
    pub fn load(config: &TranscriptionConfig, language: &str) -> Result<Self, TranscriptionError> {
        let path = config
            .whisper_model_path()
            .ok_or_else(|| TranscriptionError::Engine("no whisper_model configured".into()))?;
        let path = path.as_path();
        if !path.exists() {
            return Err(TranscriptionError::Engine(format!(
                "model not found: {}",
                path.display()
            )));
        }
        let path_str = path.to_str().ok_or_else(|| {
            TranscriptionError::Engine(format!("non-UTF-8 model path: {}", path.display()))
        })?;

        let ctx = WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
            .map_err(|e| TranscriptionError::Engine(e.to_string()))?;

        let primary = language.split(['-', '_']).next().unwrap_or("").to_lowercase();
        log::info!("stt: whisper model loaded from {}", path.display());

        Ok(Self {
            ctx: Arc::new(ctx),
            language: (!primary.is_empty()).then_some(primary),
            n_threads: std::thread::available_parallelism()
                .map(|n| n.get().min(8) as i32)
                .unwrap_or(4),
            wake_timeout: config.wake_timeout(),
            command_timeout: config.command_timeout(),
        })
    }
}

fn run_inference(
    ctx: &WhisperContext,
    audio: &[f32],
    language: Option<&str>,
    n_threads: i32,
) -> Result<String, TranscriptionError> {
    let mut fp = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    fp.set_language(language);
    fp.set_n_threads(n_threads);
    fp.set_print_progress(false);
    fp.set_print_realtime(false);

    let mut state = ctx
        .create_state()
        .map_err(|e| TranscriptionError::Engine(e.to_string()))?;
    state
        .full(fp, audio)
        .map_err(|e| TranscriptionError::Engine(e.to_string()))?;

    let n_segments = state
        .full_n_segments()
        .map_err(|e| TranscriptionError::Engine(e.to_string()))?;
    let mut text = String::new();
    for i in 0..n_segments {
        let segment = state
            .full_get_segment_text(i)
            .map_err(|e| TranscriptionError::Engine(format!("segment {i}: {e}")))?;
        text.push_str(&segment);
    }
    Ok(text.trim().to_string())
}

#[async_trait]
impl TranscriptionClient for WhisperTranscriber {
    async fn transcribe(
        &self,
        clip: &CanonicalClip,
        purpose: ClipPurpose,
    ) -> Result<String, TranscriptionError> {
        if clip.len() < MIN_AUDIO_SAMPLES {
            return Ok(String::new());
        }

        let ctx = Arc::clone(&self.ctx);
        let audio = clip.to_f32();
        let language = self.language.clone();
        let n_threads = self.n_threads;
        let budget = match purpose {
            ClipPurpose::WakeWord => self.wake_timeout,
            ClipPurpose::Command => self.command_timeout,
        };

        let task = tokio::task::spawn_blocking(move || {
            run_inference(&ctx, &audio, language.as_deref(), n_threads)
        });
        match tokio::time::timeout(budget, task).await {
            Err(_) => Err(TranscriptionError::Timeout),
            Ok(Err(join)) => Err(TranscriptionError::Engine(join.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}
