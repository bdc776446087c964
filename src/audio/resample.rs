//! Offline resampling to the canonical 16 kHz rate and channel selection.
//!
//! The converter always works on a whole clip at once, so the resampler is
//! built with a single chunk the size of the clip, flushed, and its output
//! delay trimmed.  The result is trimmed or zero-padded to exactly
//! `round(len * 16000 / rate)` samples so clip length is deterministic for
//! every source rate.
//!
//! ```text
//! interleaved PCM ──first_channel──▶ mono @ native rate
//!                 ──resample_to_16k (SincFixedIn, BlackmanHarris2)──▶ mono @ 16 kHz
//! ```

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use thiserror::Error;

use super::wav::CANONICAL_SAMPLE_RATE;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("unsupported source rate: {0} Hz")]
    InvalidRate(u32),

    #[error("failed to build resampler: {0}")]
    Construction(#[from] rubato::ResamplerConstructionError),

    #[error("resampling failed: {0}")]
    Process(#[from] rubato::ResampleError),
}

// ---------------------------------------------------------------------------
// first_channel
// ---------------------------------------------------------------------------

/// Keep channel 0 of interleaved audio.
///
/// * `channels == 1` returns the input unchanged.
/// * `channels == 0` returns an empty vector.
pub fn first_channel(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => samples.iter().step_by(n as usize).copied().collect(),
    }
}

// ---------------------------------------------------------------------------
// resample_to_16k
// ---------------------------------------------------------------------------

/// Number of 16 kHz samples produced from `len` samples at `source_rate`.
pub fn target_len(len: usize, source_rate: u32) -> usize {
    if source_rate == 0 {
        return 0;
    }
    (len as f64 * f64::from(CANONICAL_SAMPLE_RATE) / f64::from(source_rate)).round() as usize
}

/// Resample mono `samples` from `source_rate` Hz to 16 000 Hz.
///
/// * `source_rate == 16_000` returns the input unchanged.
/// * Empty input returns an empty vector.
pub fn resample_to_16k(samples: &[f32], source_rate: u32) -> Result<Vec<f32>, ResampleError> {
    if source_rate == 0 {
        return Err(ResampleError::InvalidRate(source_rate));
    }
    if source_rate == CANONICAL_SAMPLE_RATE {
        return Ok(samples.to_vec());
    }
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let ratio = f64::from(CANONICAL_SAMPLE_RATE) / f64::from(source_rate);
    let wanted = target_len(samples.len(), source_rate);

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, samples.len(), 1)?;
    let delay = resampler.output_delay();

    let mut out = resampler
        .process(&[samples], None)?
        .into_iter()
        .next()
        .unwrap_or_default();

    // Flush the filter tail until the delayed output covers the whole clip.
    let mut flushes = 0;
    while out.len() < delay + wanted && flushes < 4 {
        let tail = resampler.process_partial::<Vec<f32>>(None, None)?;
        match tail.into_iter().next() {
            Some(t) if !t.is_empty() => out.extend(t),
            _ => break,
        }
        flushes += 1;
    }

    let mut out: Vec<f32> = out.into_iter().skip(delay).collect();
    out.resize(wanted, 0.0);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
