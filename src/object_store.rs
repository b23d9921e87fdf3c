//! Remote object-store collaborator: `Download(key, path) -> ok` /
//! `Upload(path, key) -> ok`. Mechanics of the transfer are deliberately
//! not this crate's concern (§1 Non-goals) — only the contract is.

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object store request failed: {0}")]
    Request(String),
    #[error("local io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, key: &str, dest: &Path) -> Result<(), ObjectStoreError>;
    async fn upload(&self, src: &Path, key: &str) -> Result<(), ObjectStoreError>;
}

/// `aws-sdk-s3`-backed store. Bucket and region are fixed per §6.5 ("Region
/// and bucket are fixed constants").
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        let client = aws_sdk_s3::Client::new(&config);
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn download(&self, key: &str, dest: &Path) -> Result<(), ObjectStoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(key, error = %e, "object store download failed");
                ObjectStoreError::NotFound(key.to_string())
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?
            .into_bytes();

        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }

    async fn upload(&self, src: &Path, key: &str) -> Result<(), ObjectStoreError> {
        let body = aws_sdk_s3::primitives::ByteStream::from_path(src)
            .await
            .map_err(|e| ObjectStoreError::Io(std::io::Error::other(e.to_string())))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(key, error = %e, "object store upload failed");
                ObjectStoreError::Request(e.to_string())
            })?;

        Ok(())
    }
}

/// Backs `--no-upload` dry runs and tests: every download reports
/// not-found, every upload is a no-op success.
pub struct NullObjectStore;

#[async_trait]
impl ObjectStore for NullObjectStore {
    async fn download(&self, key: &str, _dest: &Path) -> Result<(), ObjectStoreError> {
        Err(ObjectStoreError::NotFound(key.to_string()))
    }

    async fn upload(&self, _src: &Path, _key: &str) -> Result<(), ObjectStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn null_store_always_misses_on_download() {
        let store = NullObjectStore;
        let tmp = NamedTempFile::new().unwrap();
        let err = store.download("trajectory/foo_cache", tmp.path()).await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn null_store_upload_is_a_no_op_success() {
        let store = NullObjectStore;
        let tmp = NamedTempFile::new().unwrap();
        store.upload(tmp.path(), "trajectory/foo_cache").await.unwrap();
    }
}
