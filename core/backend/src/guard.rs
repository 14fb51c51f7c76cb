//! Capability and context guards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use gearshed_common::{CollectionPath, DocumentPath, Error, ExecutionContext, Result};

use crate::batch::{Precondition, SetOptions, WriteOperation};
use crate::capabilities::Capabilities;
use crate::database::{Database, DocumentCallback, QueryCallback, VectorSearchOptions};
use crate::query::QueryConstraint;
use crate::snapshot::{DocumentSnapshot, QuerySnapshot};
use crate::subscription::ListenerRegistration;
use crate::value::{Document, NativeTimestamp};

/// Fail with `ContextViolation` unless `actual` is `required`.
pub fn ensure_context(
    operation: &'static str,
    actual: ExecutionContext,
    required: ExecutionContext,
) -> Result<()> {
    if actual != required {
        return Err(Error::context_violation(operation, actual));
    }
    Ok(())
}

/// A database that checks every request against the inner database's
/// declared capabilities before forwarding it.
pub struct CheckedDatabase {
    inner: Arc<dyn Database>,
}

impl CheckedDatabase {
    pub fn new(inner: Arc<dyn Database>) -> Self {
        Self { inner }
    }

    /// Wrap `inner` for handing out.
    pub fn wrap(inner: Arc<dyn Database>) -> Arc<dyn Database> {
        Arc::new(Self::new(inner))
    }

    fn rejected(&self, err: Error) -> Error {
        debug!(backend = self.inner.backend(), error = %err, "Request rejected by capability check");
        err
    }
}

#[async_trait]
impl Database for CheckedDatabase {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    fn context(&self) -> ExecutionContext {
        self.inner.context()
    }

    fn capabilities(&self) -> &Capabilities {
        self.inner.capabilities()
    }

    async fn get_doc(&self, path: &DocumentPath) -> Result<DocumentSnapshot> {
        self.inner.get_doc(path).await
    }

    async fn get_docs(
        &self,
        collection: &CollectionPath,
        constraints: &[QueryConstraint],
    ) -> Result<QuerySnapshot> {
        self.capabilities()
            .check_constraints(constraints)
            .map_err(|e| self.rejected(e))?;
        self.inner.get_docs(collection, constraints).await
    }

    async fn set_doc(&self, path: &DocumentPath, data: Document, options: SetOptions) -> Result<()> {
        self.capabilities()
            .check_document(&data)
            .map_err(|e| self.rejected(e))?;
        self.inner.set_doc(path, data, options).await
    }

    async fn update_doc(&self, path: &DocumentPath, fields: Document) -> Result<()> {
        self.capabilities()
            .check_document(&fields)
            .map_err(|e| self.rejected(e))?;
        self.inner.update_doc(path, fields).await
    }

    async fn delete_doc(&self, path: &DocumentPath) -> Result<()> {
        self.inner.delete_doc(path).await
    }

    async fn add_doc(&self, collection: &CollectionPath, data: Document) -> Result<DocumentPath> {
        self.capabilities()
            .check_document(&data)
            .map_err(|e| self.rejected(e))?;
        self.inner.add_doc(collection, data).await
    }

    fn on_doc_snapshot(
        &self,
        path: &DocumentPath,
        callback: DocumentCallback,
    ) -> Result<ListenerRegistration> {
        self.capabilities()
            .check_realtime()
            .map_err(|e| self.rejected(e))?;
        self.inner.on_doc_snapshot(path, callback)
    }

    fn on_query_snapshot(
        &self,
        collection: &CollectionPath,
        constraints: &[QueryConstraint],
        callback: QueryCallback,
    ) -> Result<ListenerRegistration> {
        let caps = self.capabilities();
        caps.check_realtime()
            .and_then(|_| caps.check_constraints(constraints))
            .map_err(|e| self.rejected(e))?;
        self.inner.on_query_snapshot(collection, constraints, callback)
    }

    async fn commit(
        &self,
        writes: Vec<WriteOperation>,
        preconditions: Vec<Precondition>,
    ) -> Result<()> {
        let caps = self.capabilities();
        let mut check = caps.check_writes(&writes);
        if check.is_ok() && writes.len() > 1 {
            check = caps.check_batch();
        }
        if check.is_ok() && !preconditions.is_empty() {
            check = caps.check_transactions();
        }
        check.map_err(|e| self.rejected(e))?;
        self.inner.commit(writes, preconditions).await
    }

    fn generate_id(&self) -> String {
        self.inner.generate_id()
    }

    async fn find_nearest(&self, options: &VectorSearchOptions) -> Result<QuerySnapshot> {
        self.capabilities()
            .check_vector_search(options)
            .map_err(|e| self.rejected(e))?;
        self.inner.find_nearest(options).await
    }

    fn encode_timestamp(&self, date: DateTime<Utc>) -> NativeTimestamp {
        self.inner.encode_timestamp(date)
    }

    fn decode_timestamp(&self, timestamp: &NativeTimestamp) -> Result<DateTime<Utc>> {
        self.inner.decode_timestamp(timestamp)
    }
}
