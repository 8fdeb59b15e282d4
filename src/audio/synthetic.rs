//! Headless audio device
//!
//! The input side generates a sine tone paced in real time; the output side
//! "plays" a file by waiting out its duration. Used by the binary when no
//! hardware backend is wired in, and by tests.

use anyhow::{bail, Result};
use std::f32::consts::PI;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::backend::{AudioBackend, AudioBackendConfig, AudioDevice, AudioFrame, PlaybackBackend};
use super::file::AudioFile;

#[derive(Debug, Clone)]
pub struct SyntheticDevice {
    /// Tone frequency in Hz
    pub frequency_hz: f32,
    /// Peak amplitude (0.0 to 1.0)
    pub amplitude: f32,
}

impl Default for SyntheticDevice {
    fn default() -> Self {
        Self {
            frequency_hz: 440.0,
            amplitude: 0.25,
        }
    }
}

#[async_trait::async_trait]
impl AudioDevice for SyntheticDevice {
    async fn open_input(&self, config: &AudioBackendConfig) -> Result<Box<dyn AudioBackend>> {
        Ok(Box::new(SyntheticMicrophone {
            config: config.clone(),
            frequency_hz: self.frequency_hz,
            amplitude: self.amplitude,
            cancel: None,
        }))
    }

    async fn open_output(&self) -> Result<Box<dyn PlaybackBackend>> {
        Ok(Box::new(SyntheticSpeaker { cancel: None }))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

pub struct SyntheticMicrophone {
    config: AudioBackendConfig,
    frequency_hz: f32,
    amplitude: f32,
    cancel: Option<CancellationToken>,
}

#[async_trait::async_trait]
impl AudioBackend for SyntheticMicrophone {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.cancel.is_some() {
            bail!("Synthetic microphone already started");
        }

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        let config = self.config.clone();
        let frequency = self.frequency_hz;
        let amplitude = self.amplitude;

        tokio::spawn(async move {
            let frame_ms = config.frame_duration_ms.max(1);
            let frames_per_tick = (config.sample_rate as u64 * frame_ms / 1000) as usize;
            let mut ticker = interval(Duration::from_millis(frame_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut phase_index: u64 = 0;
            let mut timestamp_ms = 0;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let mut samples = Vec::with_capacity(frames_per_tick * config.channels as usize);
                for _ in 0..frames_per_tick {
                    let t = phase_index as f32 / config.sample_rate as f32;
                    let value = (2.0 * PI * frequency * t).sin() * amplitude * i16::MAX as f32;
                    for _ in 0..config.channels {
                        samples.push(value as i16);
                    }
                    phase_index += 1;
                }

                let frame = AudioFrame {
                    samples,
                    sample_rate: config.sample_rate,
                    channels: config.channels,
                    timestamp_ms,
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
                timestamp_ms += frame_ms;
            }

            debug!("Synthetic microphone stopped after {}ms", timestamp_ms);
        });

        info!(
            "Synthetic microphone started: {}Hz, {} channels",
            self.config.sample_rate, self.config.channels
        );

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.cancel.is_some()
    }

    fn name(&self) -> &str {
        "synthetic-microphone"
    }
}

impl Drop for SyntheticMicrophone {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

pub struct SyntheticSpeaker {
    cancel: Option<CancellationToken>,
}

#[async_trait::async_trait]
impl PlaybackBackend for SyntheticSpeaker {
    async fn play(&mut self, audio: AudioFile) -> Result<oneshot::Receiver<()>> {
        if self.cancel.is_some() {
            bail!("Synthetic speaker already playing");
        }

        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        let duration = audio.duration();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    let _ = done_tx.send(());
                }
            }
        });

        info!(
            "Synthetic speaker playing {} ({:.1}s)",
            audio.path.display(),
            audio.duration_seconds
        );

        Ok(done_rx)
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "synthetic-speaker"
    }
}

impl Drop for SyntheticSpeaker {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}
