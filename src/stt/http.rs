//! HTTP transcription service client.
//!
//! Wire format:
//!
//! ```text
//! POST <endpoint>/transcribe      Content-Type: audio/wav   body: canonical WAV
//!   200 {"success": true,  "text": "..."}
//!   200 {"success": false, "error": "No speech detected"}   → Ok("")
//!   200 {"success": false, "error": "<other>"}              → Service
//!   5xx {"success": false, "error": "..."}                  → Http{status}
//!
//! GET  <endpoint>/status
//!   200 {"status": "running", "model_loaded": true, "sample_rate": 16000}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;

use super::client::{ClipPurpose, TranscriptionClient, TranscriptionError};
use crate::audio::wav::CANONICAL_CONTENT_TYPE;
use crate::audio::CanonicalClip;
use crate::config::TranscriptionConfig;

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    success: bool,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    #[serde(default)]
    pub model_loaded: bool,
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

pub struct HttpTranscriber {
    client: reqwest::Client,
    endpoint: String,
    wake_timeout: Duration,
    command_timeout: Duration,
}

impl HttpTranscriber {
    pub fn from_config(config: &TranscriptionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            wake_timeout: config.wake_timeout(),
            command_timeout: config.command_timeout(),
        }
    }

    fn timeout_for(&self, purpose: ClipPurpose) -> Duration {
        match purpose {
            ClipPurpose::WakeWord => self.wake_timeout,
            ClipPurpose::Command => self.command_timeout,
        }
    }

    /// Probe `GET /status`.  Used at startup to log whether the service is up.
    pub async fn status(&self) -> Result<ServiceStatus, TranscriptionError> {
        let response = self
            .client
            .get(format!("{}/status", self.endpoint))
            .timeout(self.wake_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TranscriptionError::Http {
                status: status.as_u16(),
            });
        }
        response
            .json::<ServiceStatus>()
            .await
            .map_err(|e| TranscriptionError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl TranscriptionClient for HttpTranscriber {
    async fn transcribe(
        &self,
        clip: &CanonicalClip,
        purpose: ClipPurpose,
    ) -> Result<String, TranscriptionError> {
        let response = self
            .client
            .post(format!("{}/transcribe", self.endpoint))
            .header(CONTENT_TYPE, CANONICAL_CONTENT_TYPE)
            .timeout(self.timeout_for(purpose))
            .body(clip.to_wav_bytes())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TranscriptionError::Http {
                status: status.as_u16(),
            });
        }

        let body: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| TranscriptionError::Malformed(e.to_string()))?;
        interpret(body)
    }
}

fn interpret(body: TranscribeResponse) -> Result<String, TranscriptionError> {
    if body.success {
        return Ok(body.text.unwrap_or_default().trim().to_string());
    }
    match body.error {
        Some(e) if e.to_lowercase().contains("no speech") => Ok(String::new()),
        Some(e) => Err(TranscriptionError::Service(e)),
        None => Err(TranscriptionError::Service("unspecified failure".into())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
