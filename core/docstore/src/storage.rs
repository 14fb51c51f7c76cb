//! Object storage adapter for the document store.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use gearshed_backend::{Storage, UploadResult, DEFAULT_CONTENT_TYPE};
use gearshed_common::{Error, ObjectPath, Result};

use crate::engine::bucket::ObjectBucket;
use crate::BACKEND_NAME;

/// Objects in the project's configured bucket.
pub struct DocstoreStorage {
    bucket: Arc<ObjectBucket>,
}

impl DocstoreStorage {
    pub fn new(bucket: Arc<ObjectBucket>) -> Self {
        Self { bucket }
    }

    fn not_found(path: &ObjectPath) -> Error {
        Error::NotFound(format!("No object at '{}'", path))
    }
}

#[async_trait]
impl Storage for DocstoreStorage {
    fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn upload_bytes(
        &self,
        path: &ObjectPath,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<UploadResult> {
        let key = path.as_key();
        let content_type = content_type.unwrap_or(DEFAULT_CONTENT_TYPE);
        let size = data.len() as u64;
        let stored = self.bucket.put(&key, data, content_type);

        debug!(bucket = self.bucket.name(), path = %path, size, "Uploaded object");
        Ok(UploadResult {
            path: path.clone(),
            download_url: self.bucket.download_url(&key, &stored.download_token),
            size,
            content_type: stored.content_type,
        })
    }

    async fn download_url(&self, path: &ObjectPath) -> Result<String> {
        let key = path.as_key();
        let object = self
            .bucket
            .get(&key)
            .ok_or_else(|| Self::not_found(path))?;
        Ok(self.bucket.download_url(&key, &object.download_token))
    }

    async fn delete(&self, path: &ObjectPath) -> Result<()> {
        if !self.bucket.remove(&path.as_key()) {
            return Err(Self::not_found(path));
        }
        debug!(bucket = self.bucket.name(), path = %path, "Deleted object");
        Ok(())
    }

    async fn exists(&self, path: &ObjectPath) -> Result<bool> {
        Ok(self.bucket.contains(&path.as_key()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_download_delete() {
        let storage = DocstoreStorage::new(Arc::new(ObjectBucket::new("garage")));
        let path = ObjectPath::parse("bikes/b1/receipt.txt").unwrap();

        let uploaded = storage
            .upload_data_url(&path, "data:text/plain;base64,aGVsbG8=")
            .await
            .unwrap();
        assert_eq!(uploaded.size, 5);
        assert_eq!(uploaded.content_type, "text/plain");
        assert!(storage.exists(&path).await.unwrap());
        assert_eq!(storage.download_url(&path).await.unwrap(), uploaded.download_url);

        storage.delete(&path).await.unwrap();
        assert!(!storage.exists(&path).await.unwrap());
        assert!(matches!(storage.delete(&path).await, Err(Error::NotFound(_))));
        assert!(matches!(storage.download_url(&path).await, Err(Error::NotFound(_))));
    }
}
