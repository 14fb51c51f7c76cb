//! Object storage adapter for the relational backend.

use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use gearshed_backend::{Storage, UploadResult, DEFAULT_CONTENT_TYPE};
use gearshed_common::{Error, ObjectPath, Result};

use crate::engine::objects::{ObjectEntry, ObjectIndex};
use crate::BACKEND_NAME;

/// Characters escaped inside one segment of a public object URL.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'<')
    .add(b'>');

/// Files of one bucket under the project's storage root.
pub struct RelationalStorage {
    objects: Arc<ObjectIndex>,
    bucket: String,
    url: String,
}

impl RelationalStorage {
    pub fn new(objects: Arc<ObjectIndex>, bucket: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            objects,
            bucket: bucket.into(),
            url: url.into(),
        }
    }

    /// `{url}/storage/v1/object/public/{bucket}/{path}`
    fn public_url(&self, path: &ObjectPath) -> String {
        let key = path
            .components()
            .iter()
            .map(|c| utf8_percent_encode(c, SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.url.trim_end_matches('/'),
            utf8_percent_encode(&self.bucket, SEGMENT),
            key
        )
    }

    fn not_found(&self, path: &ObjectPath) -> Error {
        Error::NotFound(format!("No object at '{}' in bucket '{}'", path, self.bucket))
    }
}

fn io_error(action: &str, file: &Path, e: std::io::Error) -> Error {
    Error::Backend(format!("Failed to {} '{}': {}", action, file.display(), e))
}

#[async_trait]
impl Storage for RelationalStorage {
    fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn upload_bytes(
        &self,
        path: &ObjectPath,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<UploadResult> {
        let file = self.objects.file_path(&self.bucket, path);
        if let Some(dir) = file.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error("create directory", dir, e))?;
        }
        tokio::fs::write(&file, &data)
            .await
            .map_err(|e| io_error("write object", &file, e))?;

        let entry = ObjectEntry {
            size: data.len() as u64,
            content_type: content_type.unwrap_or(DEFAULT_CONTENT_TYPE).to_string(),
        };
        self.objects.put(&self.bucket, path, &entry)?;

        debug!(bucket = %self.bucket, path = %path, size = entry.size, "Uploaded object");
        Ok(UploadResult {
            path: path.clone(),
            download_url: self.public_url(path),
            size: entry.size,
            content_type: entry.content_type,
        })
    }

    async fn download_url(&self, path: &ObjectPath) -> Result<String> {
        match self.objects.get(&self.bucket, path)? {
            Some(_) => Ok(self.public_url(path)),
            None => Err(self.not_found(path)),
        }
    }

    async fn delete(&self, path: &ObjectPath) -> Result<()> {
        if !self.objects.remove(&self.bucket, path)? {
            return Err(self.not_found(path));
        }
        let file = self.objects.file_path(&self.bucket, path);
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(file = %file.display(), "Indexed object had no file");
            }
            Err(e) => return Err(io_error("remove object", &file, e)),
        }
        debug!(bucket = %self.bucket, path = %path, "Deleted object");
        Ok(())
    }

    async fn exists(&self, path: &ObjectPath) -> Result<bool> {
        Ok(self.objects.get(&self.bucket, path)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rusqlite::Connection;
    use tempfile::TempDir;

    fn storage(root: &Path) -> RelationalStorage {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let objects = Arc::new(ObjectIndex::new(conn, root.to_path_buf()).unwrap());
        RelationalStorage::new(objects, "uploads", "http://localhost:54321/")
    }

    #[tokio::test]
    async fn test_upload_download_delete() {
        let dir = TempDir::new().unwrap();
        let storage = storage(dir.path());
        let path = ObjectPath::parse("bikes/b1/receipt.txt").unwrap();

        let uploaded = storage
            .upload_data_url(&path, "data:text/plain;base64,aGVsbG8=")
            .await
            .unwrap();
        assert_eq!(uploaded.size, 5);
        assert_eq!(uploaded.content_type, "text/plain");
        assert_eq!(
            uploaded.download_url,
            "http://localhost:54321/storage/v1/object/public/uploads/bikes/b1/receipt.txt"
        );
        let on_disk = std::fs::read(dir.path().join("uploads/bikes/b1/receipt.txt")).unwrap();
        assert_eq!(on_disk, b"hello");
        assert!(storage.exists(&path).await.unwrap());

        storage.delete(&path).await.unwrap();
        assert!(!storage.exists(&path).await.unwrap());
        assert!(!dir.path().join("uploads/bikes/b1/receipt.txt").exists());
        assert!(matches!(storage.delete(&path).await, Err(Error::NotFound(_))));
        assert!(matches!(storage.download_url(&path).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_url_escapes_segments() {
        let dir = TempDir::new().unwrap();
        let storage = storage(dir.path());
        let path = ObjectPath::parse("bikes/b1/front wheel.jpg").unwrap();

        let uploaded = storage
            .upload_bytes(&path, Bytes::from_static(b"\xff\xd8"), None)
            .await
            .unwrap();
        assert_eq!(uploaded.content_type, DEFAULT_CONTENT_TYPE);
        assert!(uploaded.download_url.ends_with("/uploads/bikes/b1/front%20wheel.jpg"));
    }
}
