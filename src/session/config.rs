use std::time::Duration;

use crate::audio::AudioBackendConfig;

/// Configuration for the session state machine
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Format used for every capture
    pub audio: AudioBackendConfig,

    /// How long `end_capture` waits for queued frames to reach disk
    /// before finalizing with what was written
    pub drain_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            audio: AudioBackendConfig::default(),
            drain_timeout: Duration::from_secs(5),
        }
    }
}
