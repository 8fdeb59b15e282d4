use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::RecordingId;

/// Lifecycle of one upload task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// Waiting for a worker slot
    Pending,
    /// An attempt is running
    InFlight,
    Succeeded,
    /// Last attempt failed transiently; waiting for `next_attempt_at`
    FailedRetryable,
    FailedPermanent,
}

impl UploadStatus {
    /// Succeeded and Failed-Permanent are final
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Succeeded | UploadStatus::FailedPermanent)
    }
}

/// Delivery of one recording to the remote blob store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    pub task_id: u64,
    pub recording_id: RecordingId,

    /// Remote object name, derived from the recording identity
    pub object_name: String,

    pub status: UploadStatus,

    /// Completed attempts (never decreases)
    pub attempts: u32,

    pub enqueued_at: DateTime<Utc>,

    /// Earliest time the next attempt may start
    pub next_attempt_at: DateTime<Utc>,

    /// Identifier returned by the blob store on success
    pub remote_id: Option<String>,

    pub last_error: Option<String>,
}

impl UploadTask {
    pub fn new(task_id: u64, recording_id: RecordingId, object_name: String) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            recording_id,
            object_name,
            status: UploadStatus::Pending,
            attempts: 0,
            enqueued_at: now,
            next_attempt_at: now,
            remote_id: None,
            last_error: None,
        }
    }

    /// Ready to be handed to a worker at `now`
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            UploadStatus::Pending | UploadStatus::FailedRetryable
        ) && self.next_attempt_at <= now
    }

    /// Still waiting for an attempt (not running, not finished)
    pub fn is_waiting(&self) -> bool {
        matches!(
            self.status,
            UploadStatus::Pending | UploadStatus::FailedRetryable
        )
    }
}
