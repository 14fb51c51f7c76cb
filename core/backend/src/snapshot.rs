//! Read results.

use gearshed_common::DocumentPath;

use crate::value::{get_field, Document, Value};

/// A document as read at one point in time.
///
/// `exists()` is derived from the presence of data, so a snapshot can never
/// claim to exist without data or carry data for a missing document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    path: DocumentPath,
    data: Option<Document>,
    revision: Option<u64>,
}

impl DocumentSnapshot {
    /// Snapshot of an existing document at `revision`.
    pub fn found(path: DocumentPath, data: Document, revision: u64) -> Self {
        Self {
            path,
            data: Some(data),
            revision: Some(revision),
        }
    }

    /// Snapshot of a document that does not exist.
    pub fn missing(path: DocumentPath) -> Self {
        Self {
            path,
            data: None,
            revision: None,
        }
    }

    /// The document id, the last path segment.
    pub fn id(&self) -> &str {
        self.path.id()
    }

    pub fn path(&self) -> &DocumentPath {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&Document> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<Document> {
        self.data
    }

    /// A field by dotted path.
    pub fn get(&self, field: &str) -> Option<&Value> {
        get_field(self.data.as_ref()?, field)
    }

    /// Engine write counter at read time; `None` when missing.
    pub fn revision(&self) -> Option<u64> {
        self.revision
    }
}

/// The documents matching a query, in query order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySnapshot {
    docs: Vec<DocumentSnapshot>,
}

impl QuerySnapshot {
    pub fn new(docs: Vec<DocumentSnapshot>) -> Self {
        Self { docs }
    }

    pub fn docs(&self) -> &[DocumentSnapshot] {
        &self.docs
    }

    pub fn into_docs(self) -> Vec<DocumentSnapshot> {
        self.docs
    }

    pub fn size(&self) -> usize {
        self.docs.len()
    }

    pub fn empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DocumentSnapshot> {
        self.docs.iter()
    }

    /// Ids of the documents, in order.
    pub fn ids(&self) -> Vec<&str> {
        self.docs.iter().map(DocumentSnapshot::id).collect()
    }
}

impl<'a> IntoIterator for &'a QuerySnapshot {
    type Item = &'a DocumentSnapshot;
    type IntoIter = std::slice::Iter<'a, DocumentSnapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.docs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::document;
    use proptest::prelude::*;

    fn path(id: &str) -> DocumentPath {
        DocumentPath::new("bikes", id).unwrap()
    }

    #[test]
    fn test_missing_snapshot() {
        let snap = DocumentSnapshot::missing(path("b1"));
        assert!(!snap.exists());
        assert!(snap.data().is_none());
        assert_eq!(snap.id(), "b1");
        assert_eq!(snap.revision(), None);
    }

    #[test]
    fn test_found_snapshot_field_access() {
        let data = document([("name", Value::from("trail")), ("wheels", Value::Integer(2))]);
        let snap = DocumentSnapshot::found(path("b1"), data, 3);
        assert!(snap.exists());
        assert_eq!(snap.get("name"), Some(&Value::from("trail")));
        assert_eq!(snap.revision(), Some(3));
    }

    proptest! {
        #[test]
        fn prop_exists_matches_data(
            ids in prop::collection::vec("[a-z0-9]{1,12}", 0..20),
            present in prop::collection::vec(any::<bool>(), 20),
        ) {
            let docs: Vec<DocumentSnapshot> = ids
                .iter()
                .zip(present.iter())
                .map(|(id, present)| {
                    if *present {
                        DocumentSnapshot::found(path(id), document([("id", id.as_str())]), 1)
                    } else {
                        DocumentSnapshot::missing(path(id))
                    }
                })
                .collect();

            for doc in &docs {
                prop_assert_eq!(doc.exists(), doc.data().is_some());
            }

            let snapshot = QuerySnapshot::new(docs.clone());
            prop_assert_eq!(snapshot.size(), docs.len());
            prop_assert_eq!(snapshot.empty(), docs.is_empty());
        }
    }
}
