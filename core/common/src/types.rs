//! Common types used throughout the backend layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

/// Which side of the application a capability object serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    /// End-user facing code with public, unprivileged credentials.
    Client,
    /// Trusted backend process with privileged credentials.
    Server,
}

impl ExecutionContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn validate_segment(segment: &str) -> crate::Result<()> {
    if segment.is_empty() {
        return Err(crate::Error::InvalidInput(
            "Path segment cannot be empty".to_string(),
        ));
    }
    if segment.contains('/') || segment.contains('\\') {
        return Err(crate::Error::InvalidInput(format!(
            "Path segment cannot contain separators: {}",
            segment
        )));
    }
    if segment == "." || segment == ".." {
        return Err(crate::Error::InvalidInput(format!(
            "Path segment cannot be a relative reference: {}",
            segment
        )));
    }
    Ok(())
}

fn split_path(path: &str) -> Vec<String> {
    path.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Path of a collection: `bikes`, or `bikes/b1/components` for a nested one.
///
/// Always has an odd number of segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionPath {
    segments: Vec<String>,
}

impl CollectionPath {
    /// A top-level collection.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        Self::from_segments(vec![id.into()])
    }

    /// Build from raw segments.
    ///
    /// # Errors
    /// - Any segment is invalid
    /// - The segment count is even (that would name a document)
    pub fn from_segments(segments: Vec<String>) -> crate::Result<Self> {
        for segment in &segments {
            validate_segment(segment)?;
        }
        if segments.len() % 2 != 1 {
            return Err(crate::Error::InvalidInput(format!(
                "Collection path must have an odd number of segments: {}",
                segments.join("/")
            )));
        }
        Ok(Self { segments })
    }

    /// Parse a `/`-separated collection path.
    pub fn parse(path: &str) -> crate::Result<Self> {
        Self::from_segments(split_path(path))
    }

    /// The collection id (last segment).
    pub fn id(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// The owning document, for nested collections.
    pub fn parent(&self) -> Option<DocumentPath> {
        if self.segments.len() < 3 {
            return None;
        }
        Some(DocumentPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Whether this collection lives under a document.
    pub fn is_nested(&self) -> bool {
        self.segments.len() > 1
    }

    /// Path of the document `id` inside this collection.
    pub fn doc(&self, id: impl Into<String>) -> crate::Result<DocumentPath> {
        let id = id.into();
        validate_segment(&id)?;
        let mut segments = self.segments.clone();
        segments.push(id);
        Ok(DocumentPath { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Whether `doc` is a direct child of this collection.
    pub fn contains(&self, doc: &DocumentPath) -> bool {
        doc.segments.len() == self.segments.len() + 1
            && doc.segments[..self.segments.len()] == self.segments[..]
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

/// Path of a document: `bikes/b1`, or `bikes/b1/components/c1` when nested.
///
/// Always has an even number of segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentPath {
    segments: Vec<String>,
}

impl DocumentPath {
    /// A document in a top-level collection.
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> crate::Result<Self> {
        Self::from_segments(vec![collection.into(), id.into()])
    }

    /// Build from raw segments.
    ///
    /// # Errors
    /// - Any segment is invalid
    /// - The segment count is odd or zero
    pub fn from_segments(segments: Vec<String>) -> crate::Result<Self> {
        for segment in &segments {
            validate_segment(segment)?;
        }
        if segments.is_empty() || segments.len() % 2 != 0 {
            return Err(crate::Error::InvalidInput(format!(
                "Document path must have an even number of segments: {}",
                segments.join("/")
            )));
        }
        Ok(Self { segments })
    }

    /// Parse a `/`-separated document path.
    pub fn parse(path: &str) -> crate::Result<Self> {
        Self::from_segments(split_path(path))
    }

    /// The document id (last segment).
    pub fn id(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// The collection holding this document.
    pub fn parent(&self) -> CollectionPath {
        CollectionPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        }
    }

    /// A subcollection of this document.
    pub fn collection(&self, id: impl Into<String>) -> crate::Result<CollectionPath> {
        let id = id.into();
        validate_segment(&id)?;
        let mut segments = self.segments.clone();
        segments.push(id);
        Ok(CollectionPath { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

/// A key inside an object storage bucket, e.g. `bikes/b1/photo.jpg`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectPath {
    components: Vec<String>,
}

impl ObjectPath {
    /// Parse an object key. Leading and trailing separators are ignored.
    ///
    /// # Errors
    /// - The key is empty
    /// - Any component is `.` or `..`
    pub fn parse(path: &str) -> crate::Result<Self> {
        let components = split_path(path);
        if components.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Object path cannot be empty".to_string(),
            ));
        }
        for component in &components {
            validate_segment(component)?;
        }
        Ok(Self { components })
    }

    /// The file name (last component).
    pub fn name(&self) -> &str {
        &self.components[self.components.len() - 1]
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// The key without leading separator.
    pub fn as_key(&self) -> String {
        self.components.join("/")
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// Secret configuration value that zeroizes on drop and never prints.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the secret. Do not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_document_path_parse() {
        let path = DocumentPath::parse("/bikes/b1/components/c1").unwrap();
        assert_eq!(path.id(), "c1");
        assert_eq!(path.parent().to_string(), "bikes/b1/components");
        assert_eq!(path.parent().parent().unwrap().to_string(), "bikes/b1");
    }

    #[test]
    fn test_document_path_rejects_odd_segments() {
        assert!(DocumentPath::parse("bikes").is_err());
        assert!(DocumentPath::parse("bikes/b1/components").is_err());
        assert!(DocumentPath::parse("").is_err());
    }

    #[test]
    fn test_collection_path_nesting() {
        let bikes = CollectionPath::new("bikes").unwrap();
        assert!(!bikes.is_nested());
        assert!(bikes.parent().is_none());

        let components = bikes.doc("b1").unwrap().collection("components").unwrap();
        assert!(components.is_nested());
        assert_eq!(components.id(), "components");
        assert_eq!(components.parent().unwrap().id(), "b1");
        assert!(components.contains(&components.doc("c1").unwrap()));
        assert!(!bikes.contains(&components.doc("c1").unwrap()));
    }

    #[test]
    fn test_object_path_rejects_traversal() {
        assert!(ObjectPath::parse("../etc/passwd").is_err());
        assert!(ObjectPath::parse("/").is_err());
        let path = ObjectPath::parse("/bikes/b1/photo.jpg").unwrap();
        assert_eq!(path.as_key(), "bikes/b1/photo.jpg");
        assert_eq!(path.name(), "photo.jpg");
    }

    #[test]
    fn test_secret_string_redacted() {
        let secret = SecretString::new("service-role-key");
        assert_eq!(format!("{:?}", secret), "SecretString([REDACTED])");
        assert_eq!(secret.expose(), "service-role-key");
    }

    proptest! {
        #[test]
        fn prop_document_path_display_roundtrip(
            segments in proptest::collection::vec("[a-z][a-z0-9_]{0,8}", 1..4)
        ) {
            let mut raw = Vec::new();
            for segment in &segments {
                raw.push(segment.clone());
                raw.push(format!("{}-id", segment));
            }
            let path = DocumentPath::from_segments(raw).unwrap();
            let reparsed = DocumentPath::parse(&path.to_string()).unwrap();
            prop_assert_eq!(reparsed, path);
        }
    }
}
