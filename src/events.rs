use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::session::SessionPhase;
use crate::store::{Recording, RecordingId};

/// Events emitted for rendering by the caller
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    /// The session state machine moved between phases
    StateChanged { from: SessionPhase, to: SessionPhase },

    /// A capture was finalized and stored
    RecordingFinalized { recording: Recording },

    /// A new upload task was created
    UploadQueued { recording_id: RecordingId, task_id: u64 },

    UploadSucceeded {
        recording_id: RecordingId,
        task_id: u64,
        remote_id: String,
        attempts: u32,
    },

    /// A transient failure; another attempt is scheduled
    UploadRetryScheduled {
        recording_id: RecordingId,
        task_id: u64,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },

    /// The task reached Failed-Permanent
    UploadFailed {
        recording_id: RecordingId,
        task_id: u64,
        attempts: u32,
        error: String,
    },
}

impl CoreEvent {
    /// Short name used as the SSE event type
    pub fn kind(&self) -> &'static str {
        match self {
            CoreEvent::StateChanged { .. } => "state_changed",
            CoreEvent::RecordingFinalized { .. } => "recording_finalized",
            CoreEvent::UploadQueued { .. } => "upload_queued",
            CoreEvent::UploadSucceeded { .. } => "upload_succeeded",
            CoreEvent::UploadRetryScheduled { .. } => "upload_retry_scheduled",
            CoreEvent::UploadFailed { .. } => "upload_failed",
        }
    }
}

/// Sending half shared by every component
pub type EventSender = broadcast::Sender<CoreEvent>;

pub fn channel() -> EventSender {
    let (tx, _) = broadcast::channel(256);
    tx
}

/// Publish without caring whether anyone is listening
pub(crate) fn emit(events: &EventSender, event: CoreEvent) {
    let _ = events.send(event);
}
