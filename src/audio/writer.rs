use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::backend::{AudioBackendConfig, AudioFrame};

/// Summary of the audio written for one recording
#[derive(Debug, Clone)]
pub struct WrittenAudio {
    pub file_path: PathBuf,
    pub sample_rate: u32,
    pub channels: u16,
    /// Number of interleaved samples written
    pub sample_count: usize,
    /// Size of the finalized file on disk
    pub byte_size: u64,
}

/// Writes one recording to disk as a 16-bit PCM WAV file
///
/// The target is opened with `create_new`, so an existing file is never
/// truncated.
pub struct RecordingWriter {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    written: WrittenAudio,
}

impl RecordingWriter {
    pub fn create(file_path: &Path, config: &AudioBackendConfig) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: config.channels,
            sample_rate: config.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(file_path)
            .with_context(|| format!("Failed to create recording file: {:?}", file_path))?;

        let writer = hound::WavWriter::new(BufWriter::new(file), spec)
            .with_context(|| format!("Failed to write WAV header: {:?}", file_path))?;

        Ok(Self {
            writer: Some(writer),
            written: WrittenAudio {
                file_path: file_path.to_path_buf(),
                sample_rate: config.sample_rate,
                channels: config.channels,
                sample_count: 0,
                byte_size: 0,
            },
        })
    }

    pub fn write_frame(&mut self, frame: &AudioFrame) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            for &sample in &frame.samples {
                writer
                    .write_sample(sample)
                    .context("Failed to write sample to WAV")?;
            }
            self.written.sample_count += frame.samples.len();
        }

        Ok(())
    }

    pub fn finish(mut self) -> Result<WrittenAudio> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().context("Failed to finalize WAV file")?;
        }

        self.written.byte_size = std::fs::metadata(&self.written.file_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(self.written.clone())
    }

    /// Drain `audio_rx` into the file until the channel closes or `stop` fires
    ///
    /// Frames already queued when `stop` fires are still written.
    pub async fn record(
        mut self,
        mut audio_rx: mpsc::Receiver<AudioFrame>,
        stop: CancellationToken,
    ) -> Result<WrittenAudio> {
        loop {
            tokio::select! {
                frame = audio_rx.recv() => match frame {
                    Some(frame) => self.write_frame(&frame)?,
                    None => break,
                },
                _ = stop.cancelled() => {
                    while let Ok(frame) = audio_rx.try_recv() {
                        self.write_frame(&frame)?;
                    }
                    break;
                }
            }
        }

        let written = self.finish()?;
        info!(
            "Recording file complete: {} ({} samples, {} bytes)",
            written.file_path.display(),
            written.sample_count,
            written.byte_size
        );

        Ok(written)
    }
}

impl Drop for RecordingWriter {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!("Failed to finalize WAV writer on drop: {}", e);
            }
        }
    }
}
