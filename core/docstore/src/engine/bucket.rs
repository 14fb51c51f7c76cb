//! Object buckets.

use bytes::Bytes;
use parking_lot::RwLock;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::collections::HashMap;

use gearshed_backend::auto_id;

use super::value::Timestamp;

/// Host that download URLs point at.
pub const DOWNLOAD_HOST: &str = "https://storage.docstore.local";

/// A stored object and its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
    /// Token that grants read access through the download URL.
    pub download_token: String,
    pub updated: Timestamp,
}

/// Objects of one bucket, keyed by object name.
pub struct ObjectBucket {
    name: String,
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl ObjectBucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store an object, replacing any previous one under `key`. A replaced
    /// object keeps its download token.
    pub fn put(&self, key: &str, data: Bytes, content_type: &str) -> StoredObject {
        let mut objects = self.objects.write();
        let download_token = objects
            .get(key)
            .map(|o| o.download_token.clone())
            .unwrap_or_else(auto_id);
        let object = StoredObject {
            data,
            content_type: content_type.to_string(),
            download_token,
            updated: Timestamp::now(),
        };
        objects.insert(key.to_string(), object.clone());
        object
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }

    /// Remove an object; `false` if there was none.
    pub fn remove(&self, key: &str) -> bool {
        self.objects.write().remove(key).is_some()
    }

    /// Public URL of an object.
    pub fn download_url(&self, key: &str, token: &str) -> String {
        format!(
            "{}/v0/b/{}/o/{}?alt=media&token={}",
            DOWNLOAD_HOST,
            utf8_percent_encode(&self.name, NON_ALPHANUMERIC),
            utf8_percent_encode(key, NON_ALPHANUMERIC),
            token
        )
    }
}
