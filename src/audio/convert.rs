//! Clip → [`CanonicalClip`] conversion.
//!
//! ```text
//! Clip(wav)          ──hound──▶ 16k/mono/16-bit? ──yes──▶ samples as-is
//!                                               └─no───▶ channel 0 ▶ resample
//! Clip(webm|ogg|…)   ──symphonia probe+decode──▶ channel 0 ▶ resample
//!                        └─ Unsupported ─▶ fallback converter (if configured)
//! ```
//!
//! Decoding is CPU-bound and runs on the blocking pool under a time budget.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use super::recorder::{Clip, MimeHint};
use super::resample::{first_channel, resample_to_16k};
use super::wav::{CanonicalClip, CANONICAL_CHANNELS, CANONICAL_SAMPLE_RATE};

// ---------------------------------------------------------------------------
// ConversionError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    /// Corrupt or undecodable data in a container we do understand.
    #[error("failed to decode {format} audio: {detail}")]
    Decode { format: String, detail: String },

    /// No local decoder for this container or codec.
    #[error("no local decoder for {0} audio")]
    Unsupported(String),

    #[error("decoding exceeded {0:?}")]
    DecodeTimeout(Duration),

    /// Decoding succeeded but produced no samples.
    #[error("decoded audio is empty")]
    EmptyAudio,

    /// The fallback conversion service failed.
    #[error("remote conversion failed: {0}")]
    Remote(String),
}

impl ConversionError {
    fn decode(mime: MimeHint, detail: impl ToString) -> Self {
        Self::Decode {
            format: mime.extension().to_string(),
            detail: detail.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// ClipConverter trait
// ---------------------------------------------------------------------------

/// Anything that turns a captured clip into canonical audio.  The local
/// decoder and the remote service are interchangeable behind this trait.
#[async_trait]
pub trait ClipConverter: Send + Sync {
    async fn to_canonical(&self, clip: &Clip) -> Result<CanonicalClip, ConversionError>;
}

// ---------------------------------------------------------------------------
// FormatConverter
// ---------------------------------------------------------------------------

/// Local decoder with an optional fallback for unsupported containers.
pub struct FormatConverter {
    decode_timeout: Duration,
    fallback: Option<Arc<dyn ClipConverter>>,
}

impl FormatConverter {
    pub fn new(decode_timeout: Duration) -> Self {
        Self {
            decode_timeout,
            fallback: None,
        }
    }

    /// Route clips the local decoder cannot handle to `fallback`.
    pub fn with_fallback(mut self, fallback: Arc<dyn ClipConverter>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

#[async_trait]
impl ClipConverter for FormatConverter {
    async fn to_canonical(&self, clip: &Clip) -> Result<CanonicalClip, ConversionError> {
        let bytes = clip.to_bytes();
        let mime = clip.mime();
        let budget = self.decode_timeout;

        let task = tokio::task::spawn_blocking(move || decode_to_canonical(&bytes, mime));
        let result = match tokio::time::timeout(budget, task).await {
            Err(_) => return Err(ConversionError::DecodeTimeout(budget)),
            Ok(Err(join)) => Err(ConversionError::decode(mime, join)),
            Ok(Ok(result)) => result,
        };

        match (result, &self.fallback) {
            (Err(ConversionError::Unsupported(format)), Some(fallback)) => {
                log::info!("convert: {format} not decodable locally, using fallback converter");
                fallback.to_canonical(clip).await
            }
            (result, _) => result,
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode `bytes` (captured as `mime`) into canonical audio.  Blocking.
pub fn decode_to_canonical(bytes: &[u8], mime: MimeHint) -> Result<CanonicalClip, ConversionError> {
    if bytes.is_empty() {
        return Err(ConversionError::EmptyAudio);
    }
    match mime {
        MimeHint::Wav => decode_wav(bytes),
        other => decode_container(bytes, other),
    }
}

fn decode_wav(bytes: &[u8]) -> Result<CanonicalClip, ConversionError> {
    let reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| ConversionError::decode(MimeHint::Wav, e))?;
    let spec = reader.spec();

    if spec.sample_rate == CANONICAL_SAMPLE_RATE
        && spec.channels == CANONICAL_CHANNELS
        && spec.bits_per_sample == 16
        && spec.sample_format == hound::SampleFormat::Int
    {
        let pcm = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConversionError::decode(MimeHint::Wav, e))?;
        if pcm.is_empty() {
            return Err(ConversionError::EmptyAudio);
        }
        return Ok(CanonicalClip::from_pcm16(pcm));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>(),
        hound::SampleFormat::Int => {
            let bits = u32::from(spec.bits_per_sample.clamp(1, 32));
            let scale = (1u64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
        }
    }
    .map_err(|e| ConversionError::decode(MimeHint::Wav, e))?;

    log::debug!(
        "convert: wav {} Hz, {} ch, {}-bit → resampling",
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample
    );
    finish(first_channel(&interleaved, spec.channels), spec.sample_rate, MimeHint::Wav)
}

fn decode_container(bytes: &[u8], mime: MimeHint) -> Result<CanonicalClip, ConversionError> {
    let mut hint = Hint::new();
    if mime != MimeHint::Unknown {
        hint.with_extension(mime.extension());
    }

    let source = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| {
            // No reader recognised the stream.
            log::debug!("convert: probe failed for {}: {e}", mime.extension());
            ConversionError::Unsupported(mime.extension().to_string())
        })?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| ConversionError::decode(mime, "no audio track"))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| symphonia_error(mime, e))?;

    let mut mono = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            // End of stream.
            Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(symphonia_error(mime, e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate.get_or_insert(spec.rate);
                let channels = spec.channels.count() as u16;

                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                mono.extend(first_channel(buf.samples(), channels));
            }
            Err(SymphoniaError::DecodeError(e)) => {
                log::debug!("convert: skipping bad {} packet: {e}", mime.extension());
            }
            Err(SymphoniaError::IoError(e)) => {
                log::debug!("convert: skipping unreadable {} packet: {e}", mime.extension());
            }
            Err(e) => return Err(symphonia_error(mime, e)),
        }
    }

    let rate = sample_rate.ok_or_else(|| ConversionError::decode(mime, "unknown sample rate"))?;
    finish(mono, rate, mime)
}

fn symphonia_error(mime: MimeHint, e: SymphoniaError) -> ConversionError {
    match e {
        SymphoniaError::Unsupported(what) => {
            log::debug!("convert: symphonia cannot handle {}: {what}", mime.extension());
            ConversionError::Unsupported(mime.extension().to_string())
        }
        other => ConversionError::decode(mime, other),
    }
}

fn finish(mono: Vec<f32>, rate: u32, mime: MimeHint) -> Result<CanonicalClip, ConversionError> {
    if mono.is_empty() {
        return Err(ConversionError::EmptyAudio);
    }
    let resampled = resample_to_16k(&mono, rate).map_err(|e| ConversionError::decode(mime, e))?;
    if resampled.is_empty() {
        return Err(ConversionError::EmptyAudio);
    }
    Ok(CanonicalClip::from_f32(&resampled))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
