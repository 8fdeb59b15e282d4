//! Session state
//!
//! `SessionState` owns the device handles of whatever is active, so a state
//! value can never claim to be recording without holding the capture
//! backend. `SessionPhase` is its plain, observable projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioBackend, DeviceLease, PlaybackBackend, WrittenAudio};
use crate::store::{RecordingId, RecordingKey};

/// Observable phase of the session state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Recording {
        recording_id: RecordingId,
        started_at: DateTime<Utc>,
    },
    Stopped {
        recording_id: RecordingId,
    },
    Playing {
        recording_id: RecordingId,
    },
}

impl SessionPhase {
    pub fn label(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Recording { .. } => "recording",
            SessionPhase::Stopped { .. } => "stopped",
            SessionPhase::Playing { .. } => "playing",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionPhase::Recording { .. } | SessionPhase::Playing { .. }
        )
    }
}

impl Default for SessionPhase {
    fn default() -> Self {
        Self::Idle
    }
}

pub(crate) enum SessionState {
    Idle,
    Recording(ActiveCapture),
    Stopped { last: RecordingId },
    Playing(ActivePlayback),
}

pub(crate) struct ActiveCapture {
    pub key: RecordingKey,
    pub started: Instant,
    pub backend: Box<dyn AudioBackend>,
    pub writer: JoinHandle<anyhow::Result<WrittenAudio>>,
    pub stop: CancellationToken,
    pub lease: DeviceLease,
}

pub(crate) struct ActivePlayback {
    pub recording_id: RecordingId,
    pub generation: u64,
    pub backend: Box<dyn PlaybackBackend>,
    /// Phase to return to once playback ends
    pub resume: Option<RecordingId>,
    pub lease: DeviceLease,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Recording(_) => "recording",
            SessionState::Stopped { .. } => "stopped",
            SessionState::Playing(_) => "playing",
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Recording(active) => SessionPhase::Recording {
                recording_id: active.key.id.clone(),
                started_at: active.key.captured_at,
            },
            SessionState::Stopped { last } => SessionPhase::Stopped {
                recording_id: last.clone(),
            },
            SessionState::Playing(active) => SessionPhase::Playing {
                recording_id: active.recording_id.clone(),
            },
        }
    }

    /// Last finalized recording, if the state remembers one
    pub fn last_recording(&self) -> Option<RecordingId> {
        match self {
            SessionState::Stopped { last } => Some(last.clone()),
            SessionState::Playing(active) => active.resume.clone(),
            _ => None,
        }
    }
}
