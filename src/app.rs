//! Command facade wiring the store, session machine and upload queue

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::audio::AudioDevice;
use crate::error::CoreResult;
use crate::events::{self, CoreEvent, EventSender};
use crate::permission::PermissionGate;
use crate::session::{SessionConfig, SessionMachine, SessionPhase};
use crate::store::{Recording, RecordingId, RecordingStore};
use crate::upload::{BlobStore, QueueConfig, UploadQueue, UploadTask};

/// Everything needed to start the core
pub struct VoiceTwinBuilder {
    pub data_dir: PathBuf,
    pub session: SessionConfig,
    pub queue: QueueConfig,
    pub device: Arc<dyn AudioDevice>,
    pub permission: Arc<dyn PermissionGate>,
    pub blob: Arc<dyn BlobStore>,
}

/// The capture/playback/upload core exposed to UI callers
pub struct VoiceTwin {
    store: RecordingStore,
    session: SessionMachine,
    uploads: UploadQueue,
    events: EventSender,
}

impl VoiceTwinBuilder {
    /// Open the durable stores and start the upload dispatcher
    pub async fn start(self) -> CoreResult<VoiceTwin> {
        let core = self.open().await?;
        core.uploads.start();
        Ok(core)
    }

    /// Open the durable stores without dispatching uploads
    ///
    /// Queued tasks stay where they are until [`UploadQueue::start`] is
    /// called, so read-only callers never begin an attempt.
    pub async fn open(self) -> CoreResult<VoiceTwin> {
        let events = events::channel();
        let store = RecordingStore::open(self.data_dir).await?;

        let session = SessionMachine::new(
            self.session,
            self.device,
            self.permission,
            store.clone(),
            events.clone(),
        );

        let uploads = UploadQueue::open(self.queue, store.clone(), self.blob, events.clone()).await?;

        info!("VoiceTwin core opened at {}", store.data_dir().display());

        Ok(VoiceTwin {
            store,
            session,
            uploads,
            events,
        })
    }
}

impl VoiceTwin {
    pub async fn begin_capture(&self) -> CoreResult<RecordingId> {
        self.session.begin_capture().await
    }

    pub async fn end_capture(&self) -> CoreResult<Recording> {
        self.session.end_capture().await
    }

    pub async fn begin_playback(&self, recording_id: &RecordingId) -> CoreResult<()> {
        self.session.begin_playback(recording_id).await
    }

    pub async fn end_playback(&self) -> CoreResult<()> {
        self.session.end_playback().await
    }

    pub async fn enqueue_upload(&self, recording_id: &RecordingId) -> CoreResult<UploadTask> {
        self.uploads.enqueue(recording_id).await
    }

    pub fn state(&self) -> SessionPhase {
        self.session.phase()
    }

    /// Stream of state changes and upload outcomes
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub async fn recordings(&self) -> Vec<Recording> {
        self.store.list().await
    }

    pub async fn recording(&self, recording_id: &RecordingId) -> CoreResult<Recording> {
        self.store.get(recording_id).await
    }

    pub async fn upload_tasks(&self) -> Vec<UploadTask> {
        self.uploads.tasks().await
    }

    pub fn session(&self) -> &SessionMachine {
        &self.session
    }

    pub fn uploads(&self) -> &UploadQueue {
        &self.uploads
    }

    /// Finalize any active capture, stop playback, and drain upload workers
    pub async fn shutdown(&self) {
        if let Err(e) = self.session.release_all().await {
            warn!("Failed to release audio device on shutdown: {}", e);
        }
        self.uploads.shutdown().await;
        if let Err(e) = self.store.flush().await {
            warn!("Failed to persist recording ledger on shutdown: {}", e);
        }
        info!("VoiceTwin core stopped");
    }
}
