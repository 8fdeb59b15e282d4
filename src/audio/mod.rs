pub mod backend;
pub mod exclusive;
pub mod file;
pub mod synthetic;
pub mod writer;

pub use backend::{AudioBackend, AudioBackendConfig, AudioDevice, AudioFrame, PlaybackBackend};
pub use exclusive::{DeviceLease, ExclusiveDevice, LeasePurpose};
pub use file::{AudioFile, AudioInfo};
pub use synthetic::SyntheticDevice;
pub use writer::{RecordingWriter, WrittenAudio};

/// Encoding identifier stored on every recording
pub const RECORDING_ENCODING: &str = "pcm_s16le/wav";
