pub mod app;
pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod nats;
pub mod permission;
pub mod session;
pub mod store;
pub mod upload;

pub use app::{VoiceTwin, VoiceTwinBuilder};
pub use audio::{
    AudioBackend, AudioBackendConfig, AudioDevice, AudioFile, AudioFrame, PlaybackBackend,
    SyntheticDevice,
};
pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use events::CoreEvent;
pub use http::{create_router, AppState};
pub use nats::NatsObjectStore;
pub use permission::{PermissionGate, StaticPermission};
pub use session::{SessionConfig, SessionMachine, SessionPhase};
pub use store::{Recording, RecordingId, RecordingStore};
pub use upload::{
    BlobError, BlobStore, DirectoryBlobStore, QueueConfig, RetryPolicy, UploadQueue, UploadStatus,
    UploadTask,
};
