//! Object storage capability.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use percent_encoding::percent_decode_str;

use gearshed_common::{Error, ObjectPath, Result};

/// Outcome of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub path: ObjectPath,
    pub download_url: String,
    pub size: u64,
    pub content_type: String,
}

/// Content type used when none is given.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Object storage operations.
#[async_trait]
pub trait Storage: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Store `data` at `path`, replacing any existing object.
    async fn upload_bytes(
        &self,
        path: &ObjectPath,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<UploadResult>;

    /// Store the payload of a `data:` URL at `path`.
    ///
    /// # Errors
    /// - `InvalidInput` if `data_url` is not a valid data URL
    async fn upload_data_url(&self, path: &ObjectPath, data_url: &str) -> Result<UploadResult> {
        let parsed = DataUrl::parse(data_url)?;
        self.upload_bytes(path, parsed.data, Some(parsed.mime_type.as_str()))
            .await
    }

    /// A URL the object can be fetched from.
    ///
    /// # Errors
    /// - `NotFound` if no object is stored at `path`
    async fn download_url(&self, path: &ObjectPath) -> Result<String>;

    /// Remove an object.
    ///
    /// # Errors
    /// - `NotFound` if no object is stored at `path`
    async fn delete(&self, path: &ObjectPath) -> Result<()>;

    async fn exists(&self, path: &ObjectPath) -> Result<bool>;
}

/// A parsed `data:[<mime>][;base64],<payload>` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub mime_type: String,
    pub data: Bytes,
}

impl DataUrl {
    /// # Errors
    /// - Missing `data:` scheme or `,` separator
    /// - Invalid base64 payload
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| Error::InvalidInput("Data URL must start with 'data:'".to_string()))?;
        let (meta, payload) = rest
            .split_once(',')
            .ok_or_else(|| Error::InvalidInput("Data URL has no ',' separator".to_string()))?;

        let (mime, is_base64) = match meta.strip_suffix(";base64") {
            Some(mime) => (mime, true),
            None => (meta, false),
        };
        let mime_type = if mime.is_empty() {
            "text/plain".to_string()
        } else {
            mime.to_string()
        };

        let data = if is_base64 {
            let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
            STANDARD
                .decode(compact)
                .map_err(|e| Error::InvalidInput(format!("Invalid base64 in data URL: {}", e)))?
        } else {
            percent_decode_str(payload).collect()
        };

        Ok(Self {
            mime_type,
            data: Bytes::from(data),
        })
    }
}
