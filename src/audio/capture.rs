//! Microphone capture via `cpal`.
//!
//! [`MicrophoneSource`] implements [`AudioSource`] on the system default
//! input device.  `cpal::Stream` is not `Send` on every platform, so each
//! session's stream lives on a dedicated `audio-capture` thread:
//!
//! ```text
//! acquire() ──spawn──▶ audio-capture thread: build + play stream
//!     ◀──ready(Ok(encoding) | Err)──
//!     Session{stop hook}: clear busy flag ──stop──▶ thread drops stream
//! ```
//!
//! The callback converts whatever sample format the device delivers into
//! little-endian PCM16 and pushes it through the session's tap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate};

use super::source::{
    AcquisitionError, AcquisitionReason, AudioSource, CaptureConstraints, ChunkTap, Session,
    StreamEncoding,
};
use super::wav::f32_to_i16;

/// Upper bound on device negotiation inside the capture thread.
const OPEN_WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// MicrophoneSource
// ---------------------------------------------------------------------------

/// The default input device.  At most one session is live at a time; a
/// second `acquire` while one is live fails with `DeviceBusy`.
#[derive(Debug, Default)]
pub struct MicrophoneSource {
    live: Arc<AtomicBool>,
}

impl MicrophoneSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self, constraints: &CaptureConstraints) -> Result<Session, AcquisitionError> {
        let tap = Arc::new(ChunkTap::new());
        let (ready_tx, ready_rx) = mpsc::channel::<Result<StreamEncoding, AcquisitionError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_tap = Arc::clone(&tap);
        let constraints = *constraints;

        std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match build_stream(&constraints, thread_tap) {
                    Ok((stream, encoding)) => {
                        let _ = ready_tx.send(Ok(encoding));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Blocks until the session sends stop or is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("audio: capture thread exiting");
            })
            .map_err(|e| AcquisitionError::new(AcquisitionReason::Other, e.to_string()))?;

        let encoding = ready_rx
            .recv_timeout(OPEN_WAIT)
            .map_err(|_| AcquisitionError::new(AcquisitionReason::Timeout, "device did not open"))??;

        Ok(Session::new(encoding, tap, stop_hook(Arc::clone(&self.live), stop_tx)))
    }
}

/// Frees the device slot before the capture thread winds down, so an
/// immediate re-acquire is not refused as busy.
fn stop_hook(live: Arc<AtomicBool>, stop_tx: mpsc::Sender<()>) -> impl FnOnce() + Send + Sync {
    move || {
        live.store(false, Ordering::SeqCst);
        let _ = stop_tx.send(());
    }
}

impl AudioSource for MicrophoneSource {
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<Session, AcquisitionError> {
        if self.live.swap(true, Ordering::SeqCst) {
            return Err(AcquisitionError::new(
                AcquisitionReason::DeviceBusy,
                "a session is already live",
            ));
        }
        let result = self.open(constraints);
        match &result {
            Ok(session) => log::info!("audio: session {} acquired", session.id()),
            Err(_) => self.live.store(false, Ordering::SeqCst),
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Stream setup (runs on the capture thread)
// ---------------------------------------------------------------------------

fn build_stream(
    constraints: &CaptureConstraints,
    tap: Arc<ChunkTap>,
) -> Result<(cpal::Stream, StreamEncoding), AcquisitionError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or_else(|| {
        AcquisitionError::new(AcquisitionReason::NoDevice, "no input device on the default host")
    })?;

    if constraints.echo_cancellation || constraints.noise_suppression {
        log::debug!("audio: echo cancellation / noise suppression are left to the platform");
    }

    let supported = pick_config(&device, constraints)?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let encoding = StreamEncoding::Pcm16 {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };

    let err_fn = |err: cpal::StreamError| log::error!("audio: stream error: {err}");

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                tap.deliver(&pcm16_from_f32(data));
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                tap.deliver(&pcm16_from_i16(data));
            },
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                tap.deliver(&pcm16_from_u16(data));
            },
            err_fn,
            None,
        ),
        other => {
            return Err(AcquisitionError::new(
                AcquisitionReason::Unsupported,
                format!("sample format {other:?}"),
            ))
        }
    }
    .map_err(|e| classify(e.to_string()))?;

    stream.play().map_err(|e| classify(e.to_string()))?;

    log::info!(
        "audio: capturing from {} at {} Hz, {} channel(s), {:?}",
        device.name().unwrap_or_else(|_| "<unnamed>".into()),
        config.sample_rate.0,
        config.channels,
        sample_format
    );
    Ok((stream, encoding))
}

/// Prefer a config matching the requested channel count that covers the
/// preferred rate; otherwise fall back to the device default.
fn pick_config(
    device: &cpal::Device,
    constraints: &CaptureConstraints,
) -> Result<cpal::SupportedStreamConfig, AcquisitionError> {
    let wanted = SampleRate(constraints.preferred_sample_rate);
    let usable = |f: SampleFormat| matches!(f, SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16);

    if let Ok(mut configs) = device.supported_input_configs() {
        if let Some(range) = configs.find(|c| {
            c.channels() == constraints.channels
                && usable(c.sample_format())
                && c.min_sample_rate() <= wanted
                && c.max_sample_rate() >= wanted
        }) {
            return Ok(range.with_sample_rate(wanted));
        }
    }

    device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            AcquisitionError::new(AcquisitionReason::NoDevice, e.to_string())
        }
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
            AcquisitionError::new(AcquisitionReason::Unsupported, e.to_string())
        }
        other => classify(other.to_string()),
    })
}

/// Map backend error text onto a reason code.
fn classify(detail: String) -> AcquisitionError {
    let lower = detail.to_lowercase();
    let reason = if lower.contains("permission") || lower.contains("denied") {
        AcquisitionReason::PermissionDenied
    } else if lower.contains("busy") || lower.contains("in use") {
        AcquisitionReason::DeviceBusy
    } else if lower.contains("not available") || lower.contains("no such device") {
        AcquisitionReason::NoDevice
    } else if lower.contains("not supported") {
        AcquisitionReason::Unsupported
    } else {
        AcquisitionReason::Other
    };
    AcquisitionError { reason, detail }
}

// ---------------------------------------------------------------------------
// Sample conversion
// ---------------------------------------------------------------------------

fn pcm16_from_f32(data: &[f32]) -> Vec<u8> {
    data.iter()
        .flat_map(|&s| f32_to_i16(s).to_le_bytes())
        .collect()
}

fn pcm16_from_i16(data: &[i16]) -> Vec<u8> {
    data.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn pcm16_from_u16(data: &[u16]) -> Vec<u8> {
    data.iter()
        .flat_map(|&s| ((i32::from(s) - 32_768) as i16).to_le_bytes())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
