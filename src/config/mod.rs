//! Configuration module for the voice assistant.
//!
//! Provides `AssistantConfig` (top-level settings), sub-configs for each
//! collaborator, the platform settings and model locations, and TOML
//! persistence via `AssistantConfig::load` / `AssistantConfig::save`.

pub mod settings;

pub use settings::{
    models_dir, settings_path, AssistantConfig, AudioConfig, DisplayConfig, LlmConfig,
    RetryConfig, SpeechConfig, TranscriptionBackend, TranscriptionConfig, WakeConfig,
};
