//! Database adapter for the relational backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use gearshed_backend::{
    ensure_context, Capabilities, CollectionPath, Database, DocumentCallback, DocumentPath,
    DocumentSnapshot, Emitter, ListenerRegistration, NativeTimestamp, NestingModel, Precondition,
    QueryCallback, QueryConstraint, QuerySnapshot, QuerySpec, VectorSearchOptions, WriteOperation,
};
use gearshed_common::{Error, ExecutionContext, Result};

use crate::codec;
use crate::engine::RelationalService;
use crate::BACKEND_NAME;

/// What the relational backend supports: every operator and transform,
/// child tables instead of subcollections, no vector search.
pub fn capabilities() -> Capabilities {
    Capabilities {
        vector_search: false,
        nesting: NestingModel::ForeignKey,
        ..Capabilities::full(BACKEND_NAME)
    }
}

/// Rows of the project database, one table per collection.
pub struct RelationalDatabase {
    context: ExecutionContext,
    service: Arc<RelationalService>,
    capabilities: Capabilities,
}

impl RelationalDatabase {
    pub fn new(service: Arc<RelationalService>, context: ExecutionContext) -> Self {
        Self {
            context,
            service,
            capabilities: capabilities(),
        }
    }
}

fn read_doc(service: &RelationalService, path: &DocumentPath) -> Result<DocumentSnapshot> {
    Ok(match service.get(path)? {
        Some(row) => DocumentSnapshot::found(path.clone(), row.data, row.revision),
        None => DocumentSnapshot::missing(path.clone()),
    })
}

fn read_query(
    service: &RelationalService,
    collection: &CollectionPath,
    spec: &QuerySpec,
) -> Result<QuerySnapshot> {
    let docs = service
        .query(collection, spec)?
        .into_iter()
        .map(|(path, row)| DocumentSnapshot::found(path, row.data, row.revision))
        .collect();
    Ok(QuerySnapshot::new(docs))
}

#[async_trait]
impl Database for RelationalDatabase {
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
        read_doc(&self.service, path)
    }

    async fn get_docs(
        &self,
        collection: &CollectionPath,
        constraints: &[QueryConstraint],
    ) -> Result<QuerySnapshot> {
        let spec = QuerySpec::from_constraints(constraints)?;
        read_query(&self.service, collection, &spec)
    }

    fn on_doc_snapshot(
        &self,
        path: &DocumentPath,
        callback: DocumentCallback,
    ) -> Result<ListenerRegistration> {
        ensure_context("on_doc_snapshot", self.context, ExecutionContext::Client)?;

        let emitter = Arc::new(Emitter::new(callback));
        let service: Weak<RelationalService> = Arc::downgrade(&self.service);
        let watched = path.clone();
        let sink = Arc::clone(&emitter);
        let registration = self.service.subscribe(Arc::new(move |changed: &[DocumentPath]| {
            if !changed.contains(&watched) {
                return;
            }
            let Some(service) = service.upgrade() else {
                return;
            };
            match read_doc(&service, &watched) {
                Ok(snapshot) => sink.offer(snapshot),
                Err(e) => warn!(path = %watched, error = %e, "Dropped row change"),
            }
        }));

        emitter.offer(read_doc(&self.service, path)?);
        debug!(path = %path, "Subscribed to row");
        Ok(registration)
    }

    fn on_query_snapshot(
        &self,
        collection: &CollectionPath,
        constraints: &[QueryConstraint],
        callback: QueryCallback,
    ) -> Result<ListenerRegistration> {
        ensure_context("on_query_snapshot", self.context, ExecutionContext::Client)?;
        let spec = QuerySpec::from_constraints(constraints)?;

        let emitter = Arc::new(Emitter::new(callback));
        let service: Weak<RelationalService> = Arc::downgrade(&self.service);
        let watched = collection.clone();
        let watched_spec = spec.clone();
        let sink = Arc::clone(&emitter);
        let registration = self.service.subscribe(Arc::new(move |changed: &[DocumentPath]| {
            if !changed.iter().any(|p| watched.contains(p)) {
                return;
            }
            let Some(service) = service.upgrade() else {
                return;
            };
            match read_query(&service, &watched, &watched_spec) {
                Ok(snapshot) => sink.offer(snapshot),
                Err(e) => warn!(collection = %watched, error = %e, "Dropped table change"),
            }
        }));

        emitter.offer(read_query(&self.service, collection, &spec)?);
        debug!(collection = %collection, "Subscribed to table");
        Ok(registration)
    }

    async fn commit(
        &self,
        writes: Vec<WriteOperation>,
        preconditions: Vec<Precondition>,
    ) -> Result<()> {
        self.service.commit(&writes, &preconditions)?;
        Ok(())
    }

    async fn find_nearest(&self, _options: &VectorSearchOptions) -> Result<QuerySnapshot> {
        Err(Error::Unsupported(format!(
            "{} does not support vector search",
            BACKEND_NAME
        )))
    }

    fn encode_timestamp(&self, date: DateTime<Utc>) -> NativeTimestamp {
        codec::encode_timestamp(date)
    }

    fn decode_timestamp(&self, timestamp: &NativeTimestamp) -> Result<DateTime<Utc>> {
        codec::decode_timestamp(timestamp)
    }
}
