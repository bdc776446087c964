//! Canonical audio: 16 kHz, mono, 16-bit PCM in a 44-byte-header WAV.
//!
//! [`CanonicalClip`] is the fixed interchange format handed to every
//! transcription backend.  [`pcm16_header`] writes the header byte for byte
//! (the recorder also uses it to wrap raw microphone PCM at the native rate),
//! and [`WavHeader::parse`] reads the same layout back.
//!
//! ```text
//! offset  size  field
//!      0     4  "RIFF"
//!      4     4  36 + data_len
//!      8     4  "WAVE"
//!     12     4  "fmt "
//!     16     4  16            (fmt chunk size)
//!     20     2  1             (PCM)
//!     22     2  channels
//!     24     4  sample_rate
//!     28     4  byte_rate     (sample_rate * channels * 2)
//!     32     2  block_align   (channels * 2)
//!     34     2  16            (bits per sample)
//!     36     4  "data"
//!     40     4  data_len
//!     44     …  little-endian i16 samples
//! ```

use std::time::Duration;

/// Sample rate of every [`CanonicalClip`].
pub const CANONICAL_SAMPLE_RATE: u32 = 16_000;

/// Channel count of every [`CanonicalClip`].
pub const CANONICAL_CHANNELS: u16 = 1;

/// Size of the fixed PCM WAV header.
pub const WAV_HEADER_LEN: usize = 44;

/// Content type sent alongside canonical audio.
pub const CANONICAL_CONTENT_TYPE: &str = "audio/wav";

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Build a 44-byte PCM16 WAV header for `data_len` bytes of sample data.
pub fn pcm16_header(sample_rate: u32, channels: u16, data_len: u32) -> [u8; WAV_HEADER_LEN] {
    let block_align = channels.saturating_mul(2);
    let byte_rate = sample_rate.saturating_mul(u32::from(block_align));

    let mut h = [0u8; WAV_HEADER_LEN];
    h[0..4].copy_from_slice(b"RIFF");
    h[4..8].copy_from_slice(&36u32.saturating_add(data_len).to_le_bytes());
    h[8..12].copy_from_slice(b"WAVE");
    h[12..16].copy_from_slice(b"fmt ");
    h[16..20].copy_from_slice(&16u32.to_le_bytes());
    h[20..22].copy_from_slice(&1u16.to_le_bytes());
    h[22..24].copy_from_slice(&channels.to_le_bytes());
    h[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    h[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    h[32..34].copy_from_slice(&block_align.to_le_bytes());
    h[34..36].copy_from_slice(&16u16.to_le_bytes());
    h[36..40].copy_from_slice(b"data");
    h[40..44].copy_from_slice(&data_len.to_le_bytes());
    h
}

/// Fields recovered from a 44-byte PCM WAV header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub data_len: u32,
}

impl WavHeader {
    /// Parse the fixed 44-byte layout written by [`pcm16_header`].
    ///
    /// Returns `None` for anything else (extensible formats, extra chunks,
    /// truncated input); general WAV files go through the decoder instead.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < WAV_HEADER_LEN {
            return None;
        }
        if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
            return None;
        }
        if &bytes[12..16] != b"fmt " || read_u32(bytes, 16) != 16 || read_u16(bytes, 20) != 1 {
            return None;
        }
        if &bytes[36..40] != b"data" {
            return None;
        }
        Some(Self {
            channels: read_u16(bytes, 22),
            sample_rate: read_u32(bytes, 24),
            bits_per_sample: read_u16(bytes, 34),
            data_len: read_u32(bytes, 40),
        })
    }
}

fn read_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn read_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

// ---------------------------------------------------------------------------
// Sample conversion
// ---------------------------------------------------------------------------

/// Clamp to `[-1, 1]` and scale to `i16` via `round(sample * 32767)`.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32_767.0).round() as i16
}

/// Inverse of [`f32_to_i16`] (used by in-process backends that want floats).
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32_767.0
}

// ---------------------------------------------------------------------------
// CanonicalClip
// ---------------------------------------------------------------------------

/// 16 kHz mono PCM16 audio, ready for transcription.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CanonicalClip {
    pcm16: Vec<i16>,
}

impl CanonicalClip {
    /// Wrap samples that are already 16 kHz mono.
    pub fn from_pcm16(pcm16: Vec<i16>) -> Self {
        Self { pcm16 }
    }

    /// Quantise 16 kHz mono float samples.
    pub fn from_f32(samples: &[f32]) -> Self {
        Self {
            pcm16: samples.iter().copied().map(f32_to_i16).collect(),
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.pcm16
    }

    pub fn len(&self) -> usize {
        self.pcm16.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pcm16.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        CANONICAL_SAMPLE_RATE
    }

    pub fn channels(&self) -> u16 {
        CANONICAL_CHANNELS
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.pcm16.len() as f64 / f64::from(CANONICAL_SAMPLE_RATE))
    }

    /// Float view of the samples in `[-1, 1]`.
    pub fn to_f32(&self) -> Vec<f32> {
        self.pcm16.iter().copied().map(i16_to_f32).collect()
    }

    /// Serialise into the canonical WAV byte layout.
    pub fn to_wav_bytes(&self) -> Vec<u8> {
        let data_len = u32::try_from(self.pcm16.len() * 2).unwrap_or(u32::MAX);
        let mut out = Vec::with_capacity(WAV_HEADER_LEN + self.pcm16.len() * 2);
        out.extend_from_slice(&pcm16_header(CANONICAL_SAMPLE_RATE, CANONICAL_CHANNELS, data_len));
        for s in &self.pcm16 {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
