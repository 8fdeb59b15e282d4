//! Durable recording store
//!
//! Finalized recordings are appended to a JSON ledger next to their audio
//! files. Identities combine a monotonically increasing sequence number with
//! the capture timestamp, so a storage path is never reused.

mod ledger;
pub(crate) mod persist;
mod recording;

pub use ledger::RecordingStore;
pub use recording::{Recording, RecordingId, RecordingKey};
