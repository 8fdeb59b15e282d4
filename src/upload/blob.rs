use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CoreError;

/// Failure classes reported by a blob store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    /// Timeouts, 5xx-class errors, lost connectivity
    #[error("retryable: {0}")]
    Retryable(String),

    /// Quota exceeded, authentication rejected, malformed or colliding object
    #[error("permanent: {0}")]
    Permanent(String),
}

impl From<BlobError> for CoreError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::Retryable(msg) => CoreError::UploadRetryable(msg),
            BlobError::Permanent(msg) => CoreError::UploadPermanent(msg),
        }
    }
}

/// Remote blob store capability
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `object_name`, returning the remote identifier
    async fn put(&self, object_name: &str, bytes: Vec<u8>) -> Result<String, BlobError>;

    /// Get store name for logging
    fn name(&self) -> &str;
}

/// Write-once blob store backed by a local (or mounted) directory
///
/// Object names map to relative paths under `root`.
pub struct DirectoryBlobStore {
    root: PathBuf,
}

impl DirectoryBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, object_name: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(object_name);
        let well_formed = !object_name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));

        if !well_formed {
            return Err(BlobError::Permanent(format!(
                "malformed object name: {:?}",
                object_name
            )));
        }

        Ok(self.root.join(relative))
    }
}

/// What already sits at an object's path
enum Existing {
    Missing,
    Same,
    Different,
}

async fn compare_existing(path: &Path, bytes: &[u8]) -> Result<Existing, BlobError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() != bytes.len() as u64 => return Ok(Existing::Different),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Existing::Missing),
        Err(e) => return Err(BlobError::Retryable(format!("stat {}: {}", path.display(), e))),
    }

    let stored = tokio::fs::read(path)
        .await
        .map_err(|e| BlobError::Retryable(format!("read {}: {}", path.display(), e)))?;

    Ok(if stored == bytes {
        Existing::Same
    } else {
        Existing::Different
    })
}

/// Staging file next to the object; removed on drop unless linked into place
struct PartFile {
    path: PathBuf,
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for DirectoryBlobStore {
    /// Objects only ever appear complete: bytes are staged in a part file
    /// and hard-linked into place. Re-putting identical content (a retry of
    /// an attempt whose acknowledgement was lost) succeeds; different
    /// content under a taken name is a permanent collision.
    async fn put(&self, object_name: &str, bytes: Vec<u8>) -> Result<String, BlobError> {
        let path = self.object_path(object_name)?;
        let remote_id = format!("file://{}", path.display());
        let collision = || BlobError::Permanent(format!("object {} already exists", object_name));

        match compare_existing(&path, &bytes).await? {
            Existing::Missing => {}
            Existing::Same => {
                debug!("Object {} already stored", object_name);
                return Ok(remote_id);
            }
            Existing::Different => return Err(collision()),
        }

        let parent = path.parent().unwrap_or(self.root.as_path());
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BlobError::Retryable(format!("create {}: {}", parent.display(), e)))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let part = PartFile {
            path: parent.join(format!(".{}.{}.part", file_name, Uuid::new_v4().simple())),
        };

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part.path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    BlobError::Permanent(format!("access denied for {}: {}", object_name, e))
                }
                _ => BlobError::Retryable(format!("open {}: {}", part.path.display(), e)),
            })?;

        file.write_all(&bytes)
            .await
            .map_err(|e| BlobError::Retryable(format!("write {}: {}", part.path.display(), e)))?;
        file.sync_all()
            .await
            .map_err(|e| BlobError::Retryable(format!("sync {}: {}", part.path.display(), e)))?;
        drop(file);

        match tokio::fs::hard_link(&part.path, &path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Lost a race with another writer of the same name
                return match compare_existing(&path, &bytes).await? {
                    Existing::Same => Ok(remote_id),
                    _ => Err(collision()),
                };
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(BlobError::Permanent(format!(
                    "access denied for {}: {}",
                    object_name, e
                )))
            }
            Err(e) => {
                return Err(BlobError::Retryable(format!(
                    "link {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        debug!("Stored {} bytes at {}", bytes.len(), path.display());

        Ok(remote_id)
    }

    fn name(&self) -> &str {
        "directory"
    }
}
