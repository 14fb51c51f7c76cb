//! Batched writes and transactions.
//!
//! Both accumulate [`WriteOperation`]s and hand them to
//! [`Database::commit`] in one call, so the backend applies them all or
//! none. A transaction also records the revision of every document it read
//! and the commit fails with [`Error::Conflict`] when one of them changed.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use tracing::debug;

use gearshed_common::{DocumentPath, Error, Result};

use crate::database::Database;
use crate::snapshot::DocumentSnapshot;
use crate::value::Document;

/// Most writes a single commit accepts.
pub const MAX_WRITES_PER_COMMIT: usize = 500;

/// Attempts `run_transaction` makes before giving up on conflicts.
pub const MAX_TRANSACTION_ATTEMPTS: usize = 5;

/// Options for `set`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Merge into the existing document instead of replacing it.
    pub merge: bool,
}

impl SetOptions {
    pub fn merge() -> Self {
        Self { merge: true }
    }
}

/// One write of a commit.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOperation {
    Set {
        path: DocumentPath,
        data: Document,
        merge: bool,
    },
    /// Dotted field paths address nested map fields. Fails on a missing document.
    Update {
        path: DocumentPath,
        fields: Document,
    },
    Delete {
        path: DocumentPath,
    },
}

impl WriteOperation {
    pub fn path(&self) -> &DocumentPath {
        match self {
            Self::Set { path, .. } | Self::Update { path, .. } | Self::Delete { path } => path,
        }
    }

    /// The document body carried by the write, if any.
    pub fn payload(&self) -> Option<&Document> {
        match self {
            Self::Set { data, .. } => Some(data),
            Self::Update { fields, .. } => Some(fields),
            Self::Delete { .. } => None,
        }
    }
}

/// A revision a document must still have when the commit applies.
///
/// `revision: None` requires the document to still be missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub path: DocumentPath,
    pub revision: Option<u64>,
}

fn check_commit_size(writes: &[WriteOperation]) -> Result<()> {
    if writes.len() > MAX_WRITES_PER_COMMIT {
        return Err(Error::InvalidInput(format!(
            "A commit accepts at most {} writes, got {}",
            MAX_WRITES_PER_COMMIT,
            writes.len()
        )));
    }
    Ok(())
}

/// Writes applied together by one commit.
#[must_use = "a batch does nothing until `commit` is called"]
pub struct WriteBatch<'a> {
    db: &'a dyn Database,
    writes: Vec<WriteOperation>,
}

impl<'a> WriteBatch<'a> {
    pub(crate) fn new(db: &'a dyn Database) -> Self {
        Self {
            db,
            writes: Vec::new(),
        }
    }

    pub fn set(&mut self, path: DocumentPath, data: Document) -> &mut Self {
        self.set_with_options(path, data, SetOptions::default())
    }

    pub fn set_with_options(
        &mut self,
        path: DocumentPath,
        data: Document,
        options: SetOptions,
    ) -> &mut Self {
        self.writes.push(WriteOperation::Set {
            path,
            data,
            merge: options.merge,
        });
        self
    }

    pub fn update(&mut self, path: DocumentPath, fields: Document) -> &mut Self {
        self.writes.push(WriteOperation::Update { path, fields });
        self
    }

    pub fn delete(&mut self, path: DocumentPath) -> &mut Self {
        self.writes.push(WriteOperation::Delete { path });
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Apply every write atomically.
    ///
    /// # Errors
    /// - `Unsupported` if the backend does not declare atomic batches
    /// - `InvalidInput` with more than [`MAX_WRITES_PER_COMMIT`] writes
    /// - Any error from the backend; no write is applied in that case
    pub async fn commit(self) -> Result<()> {
        self.db.capabilities().check_batch()?;
        check_commit_size(&self.writes)?;
        if self.writes.is_empty() {
            return Ok(());
        }
        debug!(backend = self.db.backend(), writes = self.writes.len(), "Committing batch");
        self.db.commit(self.writes, Vec::new()).await
    }
}

/// Reads followed by writes, committed only if nothing read has changed.
pub struct Transaction<'a> {
    db: &'a dyn Database,
    reads: BTreeMap<DocumentPath, Option<u64>>,
    writes: Vec<WriteOperation>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(db: &'a dyn Database) -> Self {
        Self {
            db,
            reads: BTreeMap::new(),
            writes: Vec::new(),
        }
    }

    /// Read a document and record its revision.
    ///
    /// # Errors
    /// - `InvalidInput` once a write has been queued
    pub async fn get(&mut self, path: &DocumentPath) -> Result<DocumentSnapshot> {
        if !self.writes.is_empty() {
            return Err(Error::InvalidInput(
                "Transactions require all reads to happen before any write".to_string(),
            ));
        }
        let snapshot = self.db.get_doc(path).await?;
        self.reads
            .entry(path.clone())
            .or_insert_with(|| snapshot.revision());
        Ok(snapshot)
    }

    pub fn set(&mut self, path: DocumentPath, data: Document) -> &mut Self {
        self.set_with_options(path, data, SetOptions::default())
    }

    pub fn set_with_options(
        &mut self,
        path: DocumentPath,
        data: Document,
        options: SetOptions,
    ) -> &mut Self {
        self.writes.push(WriteOperation::Set {
            path,
            data,
            merge: options.merge,
        });
        self
    }

    pub fn update(&mut self, path: DocumentPath, fields: Document) -> &mut Self {
        self.writes.push(WriteOperation::Update { path, fields });
        self
    }

    pub fn delete(&mut self, path: DocumentPath) -> &mut Self {
        self.writes.push(WriteOperation::Delete { path });
        self
    }

    /// Apply the writes if every document read still has the revision seen.
    ///
    /// # Errors
    /// - `Conflict` when a document read has changed since
    /// - Any error from the backend; no write is applied in that case
    pub async fn commit(self) -> Result<()> {
        check_commit_size(&self.writes)?;
        let preconditions = self
            .reads
            .into_iter()
            .map(|(path, revision)| Precondition { path, revision })
            .collect();
        self.db.commit(self.writes, preconditions).await
    }
}

impl dyn Database {
    /// Start a batch of writes.
    pub fn batch(&self) -> WriteBatch<'_> {
        WriteBatch::new(self)
    }

    /// Start a transaction.
    ///
    /// # Errors
    /// - `Unsupported` if the backend does not declare transactions
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        self.capabilities().check_transactions()?;
        Ok(Transaction::new(self))
    }

    /// Run `update` in a transaction, retrying on conflicts.
    ///
    /// The closure may run several times and must not have side effects
    /// beyond the transaction it is given.
    ///
    /// # Errors
    /// - `Conflict` after [`MAX_TRANSACTION_ATTEMPTS`] conflicting attempts
    /// - Any other error from `update` or the commit, without retrying
    pub async fn run_transaction<'a, T, F>(&'a self, mut update: F) -> Result<T>
    where
        F: for<'t> FnMut(&'t mut Transaction<'a>) -> BoxFuture<'t, Result<T>>,
    {
        self.capabilities().check_transactions()?;

        let mut attempt = 1;
        loop {
            let mut tx = Transaction::new(self);
            let value = update(&mut tx).await?;
            match tx.commit().await {
                Ok(()) => return Ok(value),
                Err(Error::Conflict(reason)) if attempt < MAX_TRANSACTION_ATTEMPTS => {
                    debug!(attempt, reason = %reason, "Transaction conflicted, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
