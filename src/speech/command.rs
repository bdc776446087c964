//! Speaks through an external program (`espeak-ng` by default).
//!
//! The child is spawned with `kill_on_drop`, so cancelling the `speak`
//! future (the controller leaving `Speaking`) also silences the speaker.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use super::{SpeechSynthesizer, TtsError, Utterance};
use crate::config::SpeechConfig;

/// espeak-ng's default rate (words per minute) and pitch (0–99).
const BASE_WPM: f32 = 175.0;
const BASE_PITCH: f32 = 50.0;

#[derive(Debug, Clone)]
pub struct CommandSpeaker {
    program: String,
    timeout: Duration,
}

impl CommandSpeaker {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &SpeechConfig) -> Self {
        Self::new(config.program.clone(), config.timeout())
    }

    fn args(utterance: &Utterance) -> Vec<String> {
        let voice = utterance.language.to_lowercase();
        let wpm = (BASE_WPM * utterance.rate).round().clamp(80.0, 450.0) as u32;
        let pitch = (BASE_PITCH * utterance.pitch).round().clamp(0.0, 99.0) as u32;
        vec![
            "-v".into(),
            voice,
            "-s".into(),
            wpm.to_string(),
            "-p".into(),
            pitch.to_string(),
            "--".into(),
            utterance.text.clone(),
        ]
    }
}

#[async_trait]
impl SpeechSynthesizer for CommandSpeaker {
    async fn speak(&self, utterance: &Utterance) -> Result<(), TtsError> {
        if utterance.text.trim().is_empty() {
            return Ok(());
        }

        let child = Command::new(&self.program)
            .args(Self::args(utterance))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    TtsError::Unavailable(format!("{}: {e}", self.program))
                }
                _ => TtsError::Failed(e.to_string()),
            })?;

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| TtsError::Timeout)?
            .map_err(|e| TtsError::Failed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::debug!("speech: {} stderr: {}", self.program, stderr.trim());
            let code = output.status.code().unwrap_or(-1);
            return Err(TtsError::Failed(format!("{} exited with code {code}", self.program)));
        }
        Ok(())
    }
}
