//! Media Acquisition - Mikrofon-Zugriff
//!
//! Verwendet cpal für Cross-Platform Audio Input. Der cpal-Stream ist nicht
//! Send und lebt deshalb auf einem eigenen Capture-Thread; nach außen gibt es
//! nur ein klonbares [`LocalAudio`] Handle.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Audio input device unavailable: {0}")]
    DeviceUnavailable(String),
}

impl From<BuildStreamError> for MediaError {
    fn from(err: BuildStreamError) -> Self {
        match err {
            // Betriebssystem-Sperren (macOS/Windows Privacy) kommen als Backend-Fehler
            BuildStreamError::BackendSpecific { err } => MediaError::PermissionDenied(err.to_string()),
            other => MediaError::DeviceUnavailable(other.to_string()),
        }
    }
}

// ============================================================================
// LOCAL AUDIO HANDLE
// ============================================================================

/// Beschreibung eines lokalen Audio-Streams für die Anzeige
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_id: String,
    pub track_id: String,
    pub sample_rate: u32,
    pub channels: u16,
}

struct LocalAudioInner {
    info: StreamInfo,
    muted: Arc<AtomicBool>,
    level: Arc<Mutex<f32>>,
    /// Wird beim Drop geschlossen und beendet damit den Capture-Thread
    _stop: Option<std::sync::mpsc::Sender<()>>,
}

/// Handle auf den lokalen Audio-Stream.
///
/// Klone teilen sich den Stream; die Aufnahme endet mit dem letzten Klon.
#[derive(Clone)]
pub struct LocalAudio {
    inner: Arc<LocalAudioInner>,
}

impl LocalAudio {
    /// Stream ohne Geräte-Capture (z.B. für Tests oder Headless-Betrieb)
    pub fn detached(info: StreamInfo) -> Self {
        Self {
            inner: Arc::new(LocalAudioInner {
                info,
                muted: Arc::new(AtomicBool::new(false)),
                level: Arc::new(Mutex::new(0.0)),
                _stop: None,
            }),
        }
    }

    pub fn info(&self) -> &StreamInfo {
        &self.inner.info
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.info.stream_id
    }

    pub fn track_id(&self) -> &str {
        &self.inner.info.track_id
    }

    /// Setzt den Mute-Status
    pub fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::Relaxed);
        tracing::debug!("Audio muted: {}", muted);
    }

    /// Gibt den Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::Relaxed)
    }

    /// Eingangspegel (RMS, 0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        *self.inner.level.lock()
    }
}

impl std::fmt::Debug for LocalAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAudio")
            .field("info", &self.inner.info)
            .field("is_muted", &self.is_muted())
            .finish()
    }
}

pub(crate) fn new_stream_info(sample_rate: u32, channels: u16) -> StreamInfo {
    StreamInfo {
        stream_id: uuid::Uuid::new_v4().to_string(),
        track_id: format!("audio-{}", uuid::Uuid::new_v4()),
        sample_rate,
        channels,
    }
}

// ============================================================================
// MEDIA SOURCE
// ============================================================================

/// Quelle für lokale Audio-Streams
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire_local_audio(&self) -> Result<LocalAudio, MediaError>;
}

/// Standard-Mikrofon des Systems
#[derive(Debug, Default, Clone, Copy)]
pub struct Microphone;

#[async_trait]
impl MediaSource for Microphone {
    async fn acquire_local_audio(&self) -> Result<LocalAudio, MediaError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let muted = Arc::new(AtomicBool::new(false));
        let level = Arc::new(Mutex::new(0.0f32));

        let thread_muted = Arc::clone(&muted);
        let thread_level = Arc::clone(&level);
        std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match open_capture(thread_muted, thread_level) {
                    Ok((stream, config)) => {
                        let _ = ready_tx.send(Ok((config.sample_rate.0, config.channels)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Blockiert bis das letzte LocalAudio-Handle gedroppt wurde
                let _ = stop_rx.recv();
                drop(stream);
                tracing::info!("Audio capture stopped");
            })
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

        let (sample_rate, channels) = ready_rx
            .await
            .map_err(|_| MediaError::DeviceUnavailable("capture thread exited".to_string()))??;

        Ok(LocalAudio {
            inner: Arc::new(LocalAudioInner {
                info: new_stream_info(sample_rate, channels),
                muted,
                level,
                _stop: Some(stop_tx),
            }),
        })
    }
}

/// Öffnet das Standard-Eingabegerät und startet die Aufnahme
fn open_capture(
    muted: Arc<AtomicBool>,
    level: Arc<Mutex<f32>>,
) -> Result<(cpal::Stream, StreamConfig), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| MediaError::DeviceUnavailable("no audio input device found".to_string()))?;

    let config = find_best_input_config(&device)?;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            if data.is_empty() {
                return;
            }
            if muted.load(Ordering::Relaxed) {
                *level.lock() = 0.0;
                return;
            }
            // Audio Level berechnen (RMS)
            let rms = (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
            *level.lock() = rms.min(1.0);
        },
        |err| {
            tracing::error!("Audio capture error: {}", err);
        },
        None,
    )?;

    stream
        .play()
        .map_err(|e| MediaError::PermissionDenied(e.to_string()))?;

    Ok((stream, config))
}

/// Findet die beste Input-Konfiguration
fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste Konfiguration: 48kHz F32, sonst F32 mit bester Rate
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    if let Some(config) = configs.iter().find(|c| {
        c.sample_format() == SampleFormat::F32
            && c.min_sample_rate() <= target_rate
            && c.max_sample_rate() >= target_rate
    }) {
        return Ok(config.clone().with_sample_rate(target_rate).into());
    }

    configs
        .into_iter()
        .find(|c| c.sample_format() == SampleFormat::F32)
        .map(|c| c.with_max_sample_rate().into())
        .ok_or_else(|| {
            MediaError::DeviceUnavailable("No F32 input configuration available".to_string())
        })
}
