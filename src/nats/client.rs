use anyhow::{Context, Result};
use async_nats::jetstream::{self, object_store};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::upload::{BlobError, BlobStore};

/// Remote blob store backed by a NATS JetStream object store bucket
pub struct NatsObjectStore {
    bucket: String,
    store: object_store::ObjectStore,
}

impl NatsObjectStore {
    /// Connect to NATS and open (or create) the bucket
    pub async fn connect(url: &str, bucket: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;
        let context = jetstream::new(client);

        let store = match context.get_object_store(bucket).await {
            Ok(store) => store,
            Err(_) => {
                info!("Creating object store bucket {}", bucket);
                context
                    .create_object_store(object_store::Config {
                        bucket: bucket.to_string(),
                        ..Default::default()
                    })
                    .await
                    .context("Failed to create object store bucket")?
            }
        };

        info!("Connected to NATS object store {}", bucket);

        Ok(Self {
            bucket: bucket.to_string(),
            store,
        })
    }

    fn remote_id(&self, info: &object_store::ObjectInfo) -> String {
        format!("nats://{}/{}#{}", self.bucket, info.name, info.nuid)
    }

    async fn same_content(
        &self,
        info: &object_store::ObjectInfo,
        bytes: &[u8],
    ) -> Result<bool, BlobError> {
        if info.size != bytes.len() {
            return Ok(false);
        }

        let mut object = self
            .store
            .get(&info.name)
            .await
            .map_err(|e| BlobError::Retryable(format!("read back {}: {}", info.name, e)))?;
        let mut stored = Vec::with_capacity(info.size);
        object
            .read_to_end(&mut stored)
            .await
            .map_err(|e| BlobError::Retryable(format!("read back {}: {}", info.name, e)))?;

        Ok(stored == bytes)
    }
}

#[async_trait::async_trait]
impl BlobStore for NatsObjectStore {
    async fn put(&self, object_name: &str, bytes: Vec<u8>) -> Result<String, BlobError> {
        // A retry after a timed-out or interrupted attempt may find its own
        // object already delivered; identical content counts as success.
        match self.store.info(object_name).await {
            Ok(info) if !info.deleted => {
                return if self.same_content(&info, &bytes).await? {
                    info!("Object {} already present in {}", object_name, self.bucket);
                    Ok(self.remote_id(&info))
                } else {
                    Err(BlobError::Permanent(format!(
                        "object {} already exists in {} with different content",
                        object_name, self.bucket
                    )))
                };
            }
            Ok(_) => {}
            Err(e) => match e.kind() {
                object_store::InfoErrorKind::NotFound => {}
                object_store::InfoErrorKind::InvalidName => {
                    return Err(BlobError::Permanent(e.to_string()))
                }
                _ => return Err(BlobError::Retryable(e.to_string())),
            },
        }

        let mut reader: &[u8] = &bytes;
        let info = self
            .store
            .put(object_name, &mut reader)
            .await
            .map_err(classify_put_error)?;

        debug!(
            "Published {} ({} bytes) to bucket {}",
            info.name,
            bytes.len(),
            self.bucket
        );

        Ok(self.remote_id(&info))
    }

    fn name(&self) -> &str {
        "nats-object-store"
    }
}

fn classify_put_error(err: object_store::PutError) -> BlobError {
    match err.kind() {
        object_store::PutErrorKind::InvalidName => BlobError::Permanent(err.to_string()),
        _ => BlobError::Retryable(err.to_string()),
    }
}
