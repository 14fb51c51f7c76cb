//! Database adapter for the document store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use gearshed_backend::value::{field_path, set_field};
use gearshed_backend::{
    ensure_context, Capabilities, CollectionPath, Database, DocumentCallback, DocumentPath, Emitter,
    DocumentSnapshot, ListenerRegistration, NativeTimestamp, Precondition, QueryCallback,
    QueryConstraint, QuerySnapshot, QuerySpec, Value, VectorSearchOptions, WriteOperation,
};
use gearshed_common::{Error, ExecutionContext, Result};

use crate::codec;
use crate::engine::query::StructuredQuery;
use crate::engine::store::{DocumentStore, Expectation, StoredDocument};
use crate::BACKEND_NAME;

/// Most operands of `in`, `not-in` and `array-contains-any`.
pub const MAX_IN_VALUES: usize = 30;

/// What the document store supports.
pub fn capabilities() -> Capabilities {
    Capabilities {
        max_in_values: Some(MAX_IN_VALUES),
        single_array_membership: true,
        ..Capabilities::full(BACKEND_NAME)
    }
}

/// Documents of one project, read and written through the engine store.
pub struct DocstoreDatabase {
    context: ExecutionContext,
    store: Arc<DocumentStore>,
    capabilities: Capabilities,
}

impl DocstoreDatabase {
    pub fn new(store: Arc<DocumentStore>, context: ExecutionContext) -> Self {
        Self {
            context,
            store,
            capabilities: capabilities(),
        }
    }

    fn query(collection: &CollectionPath, constraints: &[QueryConstraint]) -> Result<StructuredQuery> {
        let spec = QuerySpec::from_constraints(constraints)?;
        codec::encode_query(collection, &spec)
    }
}

fn snapshot(path: DocumentPath, doc: Option<StoredDocument>) -> Result<DocumentSnapshot> {
    match doc {
        Some(doc) => Ok(DocumentSnapshot::found(
            path,
            codec::decode_fields(&doc.fields)?,
            doc.revision,
        )),
        None => Ok(DocumentSnapshot::missing(path)),
    }
}

fn read_doc(store: &DocumentStore, path: &DocumentPath) -> Result<DocumentSnapshot> {
    snapshot(path.clone(), store.get(path))
}

fn read_query(store: &DocumentStore, query: &StructuredQuery) -> Result<QuerySnapshot> {
    let docs = store
        .query(query)
        .into_iter()
        .map(|(path, doc)| snapshot(path, Some(doc)))
        .collect::<Result<Vec<_>>>()?;
    Ok(QuerySnapshot::new(docs))
}

#[async_trait]
impl Database for DocstoreDatabase {
    fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    fn context(&self) -> ExecutionContext {
        self.context
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn get_doc(&self, path: &DocumentPath) -> Result<DocumentSnapshot> {
        read_doc(&self.store, path)
    }

    async fn get_docs(
        &self,
        collection: &CollectionPath,
        constraints: &[QueryConstraint],
    ) -> Result<QuerySnapshot> {
        let query = Self::query(collection, constraints)?;
        read_query(&self.store, &query)
    }

    fn on_doc_snapshot(
        &self,
        path: &DocumentPath,
        callback: DocumentCallback,
    ) -> Result<ListenerRegistration> {
        ensure_context("on_doc_snapshot", self.context, ExecutionContext::Client)?;

        let emitter = Arc::new(Emitter::new(callback));
        let store: Weak<DocumentStore> = Arc::downgrade(&self.store);
        let watched = path.clone();
        let listener_emitter = Arc::clone(&emitter);
        let registration = self.store.subscribe(Arc::new(move |changed: &[DocumentPath]| {
            if !changed.contains(&watched) {
                return;
            }
            let Some(store) = store.upgrade() else {
                return;
            };
            match read_doc(&store, &watched) {
                Ok(snapshot) => listener_emitter.offer(snapshot),
                Err(e) => warn!(path = %watched, error = %e, "Dropped document snapshot"),
            }
        }));

        emitter.offer(read_doc(&self.store, path)?);
        debug!(path = %path, "Watching document");
        Ok(registration)
    }

    fn on_query_snapshot(
        &self,
        collection: &CollectionPath,
        constraints: &[QueryConstraint],
        callback: QueryCallback,
    ) -> Result<ListenerRegistration> {
        ensure_context("on_query_snapshot", self.context, ExecutionContext::Client)?;
        let query = Self::query(collection, constraints)?;

        let emitter = Arc::new(Emitter::new(callback));
        let store: Weak<DocumentStore> = Arc::downgrade(&self.store);
        let watched = query.clone();
        let listener_emitter = Arc::clone(&emitter);
        let registration = self.store.subscribe(Arc::new(move |changed: &[DocumentPath]| {
            if !changed.iter().any(|p| watched.collection.contains(p)) {
                return;
            }
            let Some(store) = store.upgrade() else {
                return;
            };
            match read_query(&store, &watched) {
                Ok(snapshot) => listener_emitter.offer(snapshot),
                Err(e) => warn!(collection = %watched.collection, error = %e, "Dropped query snapshot"),
            }
        }));

        emitter.offer(read_query(&self.store, &query)?);
        debug!(collection = %collection, "Watching query");
        Ok(registration)
    }

    async fn commit(
        &self,
        writes: Vec<WriteOperation>,
        preconditions: Vec<Precondition>,
    ) -> Result<()> {
        let native = writes
            .iter()
            .map(codec::encode_write)
            .collect::<Result<Vec<_>>>()?;
        let expectations = preconditions
            .into_iter()
            .map(|p| Expectation {
                path: p.path,
                revision: p.revision,
            })
            .collect();

        let sequence = self.store.commit(native, expectations)?;
        debug!(writes = writes.len(), sequence, "Committed");
        Ok(())
    }

    async fn find_nearest(&self, options: &VectorSearchOptions) -> Result<QuerySnapshot> {
        options.validate()?;
        field_path(&options.vector_field)?;

        let prefilters = QuerySpec::from_constraints(&options.prefilters)?;
        if !prefilters.orders.is_empty() || prefilters.limit.is_some() || prefilters.start.is_some()
        {
            return Err(Error::InvalidInput(
                "Vector search prefilters accept only where constraints".to_string(),
            ));
        }
        let query = codec::encode_query(&options.collection, &prefilters)?;
        let candidates = read_query(&self.store, &query)?;

        let measure = options.distance_measure;
        let mut ranked: Vec<(f64, DocumentSnapshot)> = candidates
            .into_docs()
            .into_iter()
            .filter_map(|doc| {
                let vector = doc.get(&options.vector_field)?.as_vector()?;
                let distance = measure.distance(&vector, &options.query_vector)?;
                Some((distance, doc))
            })
            .filter(|(distance, _)| {
                options
                    .distance_threshold
                    .map_or(true, |threshold| measure.within(*distance, threshold))
            })
            .collect();

        ranked.sort_by(|(a, _), (b, _)| {
            let ord = a.partial_cmp(b).unwrap_or(Ordering::Equal);
            if measure.higher_is_closer() {
                ord.reverse()
            } else {
                ord
            }
        });
        ranked.truncate(options.limit);

        let docs = ranked
            .into_iter()
            .map(|(distance, doc)| match &options.distance_result_field {
                Some(field) => with_field(doc, field, Value::Double(distance)),
                None => Ok(doc),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(QuerySnapshot::new(docs))
    }

    fn encode_timestamp(&self, date: DateTime<Utc>) -> NativeTimestamp {
        codec::encode_timestamp(date)
    }

    fn decode_timestamp(&self, timestamp: &NativeTimestamp) -> Result<DateTime<Utc>> {
        codec::decode_timestamp(timestamp)
    }
}

/// A copy of a found snapshot with one more field.
fn with_field(doc: DocumentSnapshot, field: &str, value: Value) -> Result<DocumentSnapshot> {
    let segments = field_path(field)?;
    let revision = doc.revision().unwrap_or_default();
    let path = doc.path().clone();
    let mut data = doc.into_data().unwrap_or_default();
    set_field(&mut data, &segments, value);
    Ok(DocumentSnapshot::found(path, data, revision))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gearshed_backend::{document, Direction, FieldValue, FilterOp, SetOptions};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn db() -> DocstoreDatabase {
        DocstoreDatabase::new(Arc::new(DocumentStore::new()), ExecutionContext::Client)
    }

    fn bike(id: &str) -> DocumentPath {
        DocumentPath::new("bikes", id).unwrap()
    }

    #[tokio::test]
    async fn test_increment_twice() {
        let db = db();
        db.set_doc(&bike("b1"), document([("km", 0)]), SetOptions::default())
            .await
            .unwrap();
        for _ in 0..2 {
            db.update_doc(&bike("b1"), document([("km", FieldValue::increment(5))]))
                .await
                .unwrap();
        }
        let snap = db.get_doc(&bike("b1")).await.unwrap();
        assert_eq!(snap.get("km"), Some(&Value::Integer(10)));
    }

    #[tokio::test]
    async fn test_merge_vs_replace() {
        let db = db();
        db.set_doc(
            &bike("b1"),
            document([("name", "trail"), ("color", "red")]),
            SetOptions::default(),
        )
        .await
        .unwrap();

        db.set_doc(&bike("b1"), document([("color", "blue")]), SetOptions::merge())
            .await
            .unwrap();
        let merged = db.get_doc(&bike("b1")).await.unwrap();
        assert_eq!(merged.get("name"), Some(&Value::from("trail")));
        assert_eq!(merged.get("color"), Some(&Value::from("blue")));

        db.set_doc(&bike("b1"), document([("color", "green")]), SetOptions::default())
            .await
            .unwrap();
        let replaced = db.get_doc(&bike("b1")).await.unwrap();
        assert_eq!(replaced.get("name"), None);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let err = db()
            .update_doc(&bike("nope"), document([("km", 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_query_and_pagination() {
        let db = db();
        for (id, km) in [("a", 300), ("b", 100), ("c", 200)] {
            db.set_doc(&bike(id), document([("km", km)]), SetOptions::default())
                .await
                .unwrap();
        }
        let bikes = CollectionPath::new("bikes").unwrap();
        let first = db
            .get_docs(
                &bikes,
                &[
                    QueryConstraint::order_by("km", Direction::Ascending),
                    QueryConstraint::limit(2),
                ],
            )
            .await
            .unwrap();
        assert_eq!(first.ids(), vec!["b", "c"]);

        let last = first.docs()[1].clone();
        let next = db
            .get_docs(
                &bikes,
                &[
                    QueryConstraint::order_by("km", Direction::Ascending),
                    QueryConstraint::start_after(last),
                ],
            )
            .await
            .unwrap();
        assert_eq!(next.ids(), vec!["a"]);

        let filtered = db
            .get_docs(&bikes, &[QueryConstraint::where_("km", FilterOp::In, vec![Value::from(100), Value::from(300)])])
            .await
            .unwrap();
        assert_eq!(filtered.ids(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_doc_listener() {
        let db = db();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registration = db
            .on_doc_snapshot(
                &bike("b1"),
                Box::new(move |_| {
                    counter.fetch_add(1, AtomicOrdering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);

        db.set_doc(&bike("b1"), document([("km", 1)]), SetOptions::default())
            .await
            .unwrap();
        db.set_doc(&bike("b2"), document([("km", 1)]), SetOptions::default())
            .await
            .unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);

        registration.unsubscribe();
        db.delete_doc(&bike("b1")).await.unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_listeners_are_client_only() {
        let db = DocstoreDatabase::new(Arc::new(DocumentStore::new()), ExecutionContext::Server);
        let err = db.on_doc_snapshot(&bike("b1"), Box::new(|_| {})).unwrap_err();
        assert!(err.is_context_violation());
    }

    #[tokio::test]
    async fn test_find_nearest() {
        let db = db();
        for (id, v) in [("a", [1.0, 0.0]), ("b", [0.0, 1.0]), ("c", [0.7, 0.7])] {
            db.set_doc(
                &bike(id),
                document([("embedding", Value::Array(v.iter().map(|x| Value::Double(*x)).collect()))]),
                SetOptions::default(),
            )
            .await
            .unwrap();
        }

        let options = VectorSearchOptions::new(
            CollectionPath::new("bikes").unwrap(),
            "embedding",
            vec![1.0, 0.1],
            2,
        )
        .with_distance_result_field("distance");
        let nearest = db.find_nearest(&options).await.unwrap();
        assert_eq!(nearest.ids(), vec!["a", "c"]);
        assert!(nearest.docs()[0].get("distance").is_some());
    }
}
