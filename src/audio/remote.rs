//! Remote conversion service, used for containers the local decoder cannot
//! open.
//!
//! `POST <endpoint>/convert?format=<tag>` with the original clip bytes; the
//! service answers with WAV bytes, which are parsed (and normalised, if the
//! service did not already produce 16 kHz mono) by the local WAV path.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use super::convert::{decode_to_canonical, ClipConverter, ConversionError};
use super::recorder::{Clip, MimeHint};
use super::wav::CanonicalClip;

pub struct RemoteConverter {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteConverter {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    fn url(&self, mime: MimeHint) -> String {
        format!(
            "{}/convert?format={}",
            self.endpoint.trim_end_matches('/'),
            mime.extension()
        )
    }
}

#[async_trait]
impl ClipConverter for RemoteConverter {
    async fn to_canonical(&self, clip: &Clip) -> Result<CanonicalClip, ConversionError> {
        let url = self.url(clip.mime());
        log::debug!("convert: remote {} ({} bytes)", url, clip.byte_len());

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, clip.mime().content_type())
            .body(clip.to_bytes())
            .send()
            .await
            .map_err(|e| ConversionError::Remote(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConversionError::Remote(format!("HTTP {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ConversionError::Remote(e.to_string()))?;
        decode_to_canonical(&bytes, MimeHint::Wav)
    }
}
