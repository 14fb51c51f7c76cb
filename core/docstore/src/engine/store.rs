//! Document storage with atomic commits and change notification.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use gearshed_backend::subscription::register;
use gearshed_backend::{ListenerRegistration, ListenerSet};
use gearshed_common::{CollectionPath, DocumentPath, Error, Result};

use super::query::StructuredQuery;
use super::value::{assign, erase, lookup, NativeMap, Timestamp, Transform};

/// A stored document and the commit that last wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub fields: NativeMap,
    pub revision: u64,
    pub update_time: Timestamp,
}

/// A transform on one field path.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldTransform {
    pub field: Vec<String>,
    pub transform: Transform,
}

/// What a write does to the document body before transforms run.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteKind {
    /// Replace the whole document.
    Set(NativeMap),
    /// Copy the masked paths from `fields`; masked paths absent from
    /// `fields` are removed. Creates the document if missing.
    Merge { fields: NativeMap, mask: Vec<Vec<String>> },
    /// Like `Merge`, but the document must exist.
    Update { fields: NativeMap, mask: Vec<Vec<String>> },
    Delete,
}

/// One write of a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub path: DocumentPath,
    pub kind: WriteKind,
    pub transforms: Vec<FieldTransform>,
}

/// The revision a document must have for a commit to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub path: DocumentPath,
    /// `None` requires the document to be missing.
    pub revision: Option<u64>,
}

type ChangeListener = dyn Fn(&[DocumentPath]) + Send + Sync;

#[derive(Default)]
struct State {
    docs: BTreeMap<DocumentPath, StoredDocument>,
    sequence: u64,
}

/// All documents of one project.
pub struct DocumentStore {
    state: Mutex<State>,
    listeners: Arc<ListenerSet<ChangeListener>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            listeners: Arc::new(ListenerSet::new()),
        }
    }

    pub fn get(&self, path: &DocumentPath) -> Option<StoredDocument> {
        self.state.lock().docs.get(path).cloned()
    }

    /// Documents of the query's collection that match it, in query order.
    pub fn query(&self, query: &StructuredQuery) -> Vec<(DocumentPath, StoredDocument)> {
        let state = self.state.lock();
        let in_collection = collection_docs(&state, &query.collection);
        let hits = query.run(
            in_collection
                .iter()
                .map(|(path, doc)| (path.id(), &doc.fields)),
        );

        hits.into_iter()
            .filter_map(|(id, _)| {
                let path = query.collection.doc(id).ok()?;
                let doc = state.docs.get(&path)?.clone();
                Some((path, doc))
            })
            .collect()
    }

    /// Every document directly inside `collection`.
    pub fn documents(&self, collection: &CollectionPath) -> Vec<(DocumentPath, StoredDocument)> {
        let state = self.state.lock();
        collection_docs(&state, collection)
            .into_iter()
            .map(|(p, d)| (p.clone(), d.clone()))
            .collect()
    }

    /// Apply every write or none.
    ///
    /// # Errors
    /// - `Conflict` when an expectation does not hold
    /// - `NotFound` when an update targets a missing document
    pub fn commit(&self, writes: Vec<Write>, expectations: Vec<Expectation>) -> Result<u64> {
        let changed: Vec<DocumentPath>;
        let sequence;
        {
            let mut state = self.state.lock();

            for expected in &expectations {
                let actual = state.docs.get(&expected.path).map(|d| d.revision);
                if actual != expected.revision {
                    return Err(Error::Conflict(format!(
                        "Document '{}' changed since it was read",
                        expected.path
                    )));
                }
            }

            sequence = state.sequence + 1;
            let commit_time = Timestamp::now();

            // Stage against a working copy so a failing write leaves no trace.
            let mut staged: BTreeMap<DocumentPath, Option<NativeMap>> = BTreeMap::new();
            for write in &writes {
                let current = match staged.get(&write.path) {
                    Some(staged) => staged.clone(),
                    None => state.docs.get(&write.path).map(|d| d.fields.clone()),
                };
                let next = apply_write(current, write, commit_time)?;
                staged.insert(write.path.clone(), next);
            }

            for (path, fields) in &staged {
                match fields {
                    Some(fields) => {
                        state.docs.insert(
                            path.clone(),
                            StoredDocument {
                                fields: fields.clone(),
                                revision: sequence,
                                update_time: commit_time,
                            },
                        );
                    }
                    None => {
                        state.docs.remove(path);
                    }
                }
            }
            state.sequence = sequence;
            changed = staged.into_keys().collect();
        }

        debug!(sequence, documents = changed.len(), "Committed writes");
        self.notify(&changed);
        Ok(sequence)
    }

    /// Call `listener` with the changed paths after every commit.
    pub fn subscribe(&self, listener: Arc<ChangeListener>) -> ListenerRegistration {
        let (_, registration) = register(&self.listeners, listener);
        registration
    }

    fn notify(&self, changed: &[DocumentPath]) {
        if changed.is_empty() {
            return;
        }
        for (_, listener) in self.listeners.snapshot() {
            listener(changed);
        }
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn collection_docs<'a>(
    state: &'a State,
    collection: &CollectionPath,
) -> Vec<(&'a DocumentPath, &'a StoredDocument)> {
    state
        .docs
        .iter()
        .filter(|(path, _)| collection.contains(path))
        .collect()
}

fn apply_write(
    current: Option<NativeMap>,
    write: &Write,
    commit_time: Timestamp,
) -> Result<Option<NativeMap>> {
    let mut fields = match &write.kind {
        WriteKind::Delete => return Ok(None),
        WriteKind::Set(fields) => fields.clone(),
        WriteKind::Merge { fields, mask } => {
            let mut base = current.unwrap_or_default();
            apply_mask(&mut base, fields, mask);
            base
        }
        WriteKind::Update { fields, mask } => {
            let mut base = current.ok_or_else(|| {
                Error::NotFound(format!("No document to update: {}", write.path))
            })?;
            apply_mask(&mut base, fields, mask);
            base
        }
    };

    for FieldTransform { field, transform } in &write.transforms {
        let value = transform.apply(lookup(&fields, field), commit_time);
        assign(&mut fields, field, value);
    }

    Ok(Some(fields))
}

fn apply_mask(base: &mut NativeMap, fields: &NativeMap, mask: &[Vec<String>]) {
    let mut seen = BTreeSet::new();
    for path in mask {
        if !seen.insert(path) {
            continue;
        }
        match lookup(fields, path) {
            Some(value) => assign(base, path, value.clone()),
            None => erase(base, path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::value::NativeValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn path(id: &str) -> DocumentPath {
        DocumentPath::new("bikes", id).unwrap()
    }

    fn fields_from<const N: usize>(pairs: [(&str, NativeValue); N]) -> NativeMap {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn set(id: &str, fields: NativeMap) -> Write {
        Write {
            path: path(id),
            kind: WriteKind::Set(fields),
            transforms: Vec::new(),
        }
    }

    #[test]
    fn test_commit_is_atomic() {
        let store = DocumentStore::new();
        let writes = vec![
            set("a", fields_from([("n", NativeValue::Integer(1))])),
            Write {
                path: path("missing"),
                kind: WriteKind::Update {
                    fields: NativeMap::new(),
                    mask: vec![vec!["n".to_string()]],
                },
                transforms: Vec::new(),
            },
        ];
        assert!(matches!(store.commit(writes, Vec::new()), Err(Error::NotFound(_))));
        assert!(store.get(&path("a")).is_none());
    }

    #[test]
    fn test_expectations() {
        let store = DocumentStore::new();
        let rev = store
            .commit(vec![set("a", fields_from([("n", NativeValue::Integer(1))]))], Vec::new())
            .unwrap();

        let stale = Expectation {
            path: path("a"),
            revision: Some(rev - 1),
        };
        assert!(matches!(
            store.commit(vec![], vec![stale]),
            Err(Error::Conflict(_))
        ));

        let current = Expectation {
            path: path("a"),
            revision: Some(rev),
        };
        assert!(store.commit(vec![], vec![current]).is_ok());
    }

    #[test]
    fn test_merge_mask_and_transforms() {
        let store = DocumentStore::new();
        store
            .commit(
                vec![set(
                    "a",
                    fields_from([
                        ("name", NativeValue::String("trail".into())),
                        ("km", NativeValue::Integer(5)),
                    ]),
                )],
                Vec::new(),
            )
            .unwrap();

        store
            .commit(
                vec![Write {
                    path: path("a"),
                    kind: WriteKind::Merge {
                        fields: fields_from([("color", NativeValue::String("red".into()))]),
                        mask: vec![vec!["color".to_string()], vec!["name".to_string()]],
                    },
                    transforms: vec![FieldTransform {
                        field: vec!["km".to_string()],
                        transform: Transform::Increment(NativeValue::Integer(5)),
                    }],
                }],
                Vec::new(),
            )
            .unwrap();

        let doc = store.get(&path("a")).unwrap();
        assert_eq!(doc.fields.get("km"), Some(&NativeValue::Integer(10)));
        assert_eq!(doc.fields.get("color"), Some(&NativeValue::String("red".into())));
        assert_eq!(doc.fields.get("name"), None);
    }

    #[test]
    fn test_listeners_see_changed_paths() {
        let store = DocumentStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let registration = store.subscribe(Arc::new(move |changed: &[DocumentPath]| {
            counter.fetch_add(changed.len(), Ordering::SeqCst);
        }));

        store
            .commit(
                vec![
                    set("a", NativeMap::new()),
                    set("b", NativeMap::new()),
                ],
                Vec::new(),
            )
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        registration.unsubscribe();
        store.commit(vec![set("c", NativeMap::new())], Vec::new()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_nested_collection_scope() {
        let store = DocumentStore::new();
        let parts = CollectionPath::parse("bikes/a/components").unwrap();
        store
            .commit(
                vec![
                    set("a", NativeMap::new()),
                    Write {
                        path: parts.doc("c1").unwrap(),
                        kind: WriteKind::Set(NativeMap::new()),
                        transforms: Vec::new(),
                    },
                ],
                Vec::new(),
            )
            .unwrap();

        assert_eq!(store.documents(&parts).len(), 1);
        assert_eq!(
            store.documents(&CollectionPath::new("bikes").unwrap()).len(),
            1
        );
    }
}
