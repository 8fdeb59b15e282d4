//! Upload queue
//!
//! Delivers finalized recordings to a remote blob store:
//! - Idempotent enqueue per recording
//! - Bounded number of concurrent uploads
//! - Exponential backoff with jitter for transient failures
//! - Durable ledger; interrupted uploads resume as Pending after restart

mod backoff;
mod blob;
mod queue;
mod task;

pub use backoff::RetryPolicy;
pub use blob::{BlobError, BlobStore, DirectoryBlobStore};
pub use queue::{object_name, QueueConfig, UploadQueue};
pub use task::{UploadStatus, UploadTask};
