use anyhow::Result;
use tokio::sync::{mpsc, oneshot};

use super::file::AudioFile;

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

/// Configuration for audio backends
#[derive(Debug, Clone)]
pub struct AudioBackendConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,
    /// Channel count (1 = mono, 2 = stereo)
    pub channels: u16,
    /// Frame size in milliseconds (affects latency)
    pub frame_duration_ms: u64,
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_duration_ms: 100,
        }
    }
}

/// Audio capture backend trait
///
/// One instance covers one recording: it is opened by [`AudioDevice::open_input`],
/// started once and stopped once.
#[async_trait::async_trait]
pub trait AudioBackend: Send + Sync {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive audio frames. The channel
    /// closes once the backend stops.
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>>;

    /// Stop capturing audio
    async fn stop(&mut self) -> Result<()>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Audio playback backend trait
#[async_trait::async_trait]
pub trait PlaybackBackend: Send + Sync {
    /// Begin playing `audio`
    ///
    /// The returned receiver resolves when the device reaches end-of-stream.
    /// It is dropped without a value if playback is stopped early.
    async fn play(&mut self, audio: AudioFile) -> Result<oneshot::Receiver<()>>;

    /// Stop playback
    async fn stop(&mut self) -> Result<()>;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// The single hardware endpoint used for both capture and playback
///
/// Implementations report acquisition failures (device claimed by another
/// process, driver errors) as `Err`.
#[async_trait::async_trait]
pub trait AudioDevice: Send + Sync {
    /// Open the input side for one recording
    async fn open_input(&self, config: &AudioBackendConfig) -> Result<Box<dyn AudioBackend>>;

    /// Open the output side for one playback
    async fn open_output(&self) -> Result<Box<dyn PlaybackBackend>>;

    /// Get device name for logging
    fn name(&self) -> &str;
}
