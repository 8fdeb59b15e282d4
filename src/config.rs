use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::audio::AudioBackendConfig;
use crate::session::SessionConfig;
use crate::upload::{QueueConfig, RetryPolicy};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub audio: AudioConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for the recording ledger, audio files and upload ledger
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u64,
    /// Stand-in for the platform permission prompt result
    pub microphone_authorized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadBackend {
    Directory,
    Nats,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub backend: UploadBackend,
    /// Target directory for the directory backend
    pub directory: String,
    pub nats_url: String,
    pub bucket: String,
    pub object_prefix: String,
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub attempt_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "voicetwin".to_string(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 7878,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.local/share/voicetwin".to_string(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_duration_ms: 100,
            microphone_authorized: true,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            backend: UploadBackend::Directory,
            directory: "~/.local/share/voicetwin/remote".to_string(),
            nats_url: "nats://localhost:4222".to_string(),
            bucket: "voicetwin-uploads".to_string(),
            object_prefix: "recordings".to_string(),
            max_concurrent: 2,
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: 0.2,
            attempt_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load from `path` (any extension the config crate understands, optional)
    /// layered under `VOICETWIN__SECTION__KEY` environment variables
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("VOICETWIN").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

impl StorageConfig {
    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }
}

impl AudioConfig {
    pub fn backend_config(&self) -> AudioBackendConfig {
        AudioBackendConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            frame_duration_ms: self.frame_duration_ms,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            audio: self.backend_config(),
            ..SessionConfig::default()
        }
    }
}

impl UploadConfig {
    pub fn directory(&self) -> PathBuf {
        expand_path(&self.directory)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.max_concurrent,
            retry: self.retry_policy(),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
            object_prefix: self.object_prefix.clone(),
        }
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}
