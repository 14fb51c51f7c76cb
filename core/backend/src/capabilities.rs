//! Capability declarations.
//!
//! Each database adapter declares what its backend can do. Queries and
//! writes that use anything undeclared are rejected with
//! [`Error::Unsupported`] before they reach the adapter.

use std::collections::BTreeSet;

use gearshed_common::{Error, Result};

use crate::batch::WriteOperation;
use crate::database::VectorSearchOptions;
use crate::query::{FilterOp, QueryConstraint, QuerySpec};
use crate::value::{Document, FieldValueKind};

/// How documents nested under a parent document are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestingModel {
    /// The backend has native subcollections.
    Native,
    /// Children live in their own table with a column naming the parent.
    ForeignKey,
}

/// What a database backend supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub backend: &'static str,
    pub operators: BTreeSet<FilterOp>,
    pub field_values: BTreeSet<FieldValueKind>,
    pub atomic_batch: bool,
    pub transactions: bool,
    pub vector_search: bool,
    pub realtime: bool,
    /// Maximum operand count of `in`, `not-in` and `array-contains-any`.
    pub max_in_values: Option<usize>,
    /// At most one `array-contains`/`array-contains-any` filter per query.
    pub single_array_membership: bool,
    pub nesting: NestingModel,
}

impl Capabilities {
    /// Everything supported, no limits.
    pub fn full(backend: &'static str) -> Self {
        Self {
            backend,
            operators: FilterOp::ALL.into_iter().collect(),
            field_values: FieldValueKind::ALL.into_iter().collect(),
            atomic_batch: true,
            transactions: true,
            vector_search: true,
            realtime: true,
            max_in_values: None,
            single_array_membership: false,
            nesting: NestingModel::Native,
        }
    }

    pub fn supports_operator(&self, op: FilterOp) -> bool {
        self.operators.contains(&op)
    }

    pub fn supports_field_value(&self, kind: FieldValueKind) -> bool {
        self.field_values.contains(&kind)
    }

    fn unsupported(&self, what: impl std::fmt::Display) -> Error {
        Error::Unsupported(format!("{} does not support {}", self.backend, what))
    }

    /// Normalize and check a constraint list.
    pub fn check_constraints(&self, constraints: &[QueryConstraint]) -> Result<QuerySpec> {
        let spec = QuerySpec::from_constraints(constraints)?;
        self.check_query(&spec)?;
        Ok(spec)
    }

    /// Check a normalized query against the declared capabilities.
    pub fn check_query(&self, spec: &QuerySpec) -> Result<()> {
        for filter in &spec.filters {
            if !self.supports_operator(filter.op) {
                return Err(self.unsupported(format_args!("the '{}' operator", filter.op)));
            }
            if let Some(max) = self.max_in_values {
                if filter.op.takes_list() && filter.values().len() > max {
                    return Err(self.unsupported(format_args!(
                        "more than {} values in a '{}' filter",
                        max, filter.op
                    )));
                }
            }
        }

        if self.single_array_membership && spec.array_membership_filters() > 1 {
            return Err(self.unsupported("more than one array-membership filter per query"));
        }

        Ok(())
    }

    /// Check a document payload for undeclared field transforms.
    pub fn check_document(&self, doc: &Document) -> Result<()> {
        let mut kinds = BTreeSet::new();
        for value in doc.values() {
            value.collect_field_value_kinds(&mut kinds);
        }
        match kinds.into_iter().find(|k| !self.supports_field_value(*k)) {
            Some(kind) => Err(self.unsupported(format_args!("the {} field transform", kind))),
            None => Ok(()),
        }
    }

    /// Check every write of a commit.
    pub fn check_writes(&self, writes: &[WriteOperation]) -> Result<()> {
        for write in writes {
            if let Some(doc) = write.payload() {
                self.check_document(doc)?;
            }
        }
        Ok(())
    }

    pub fn check_vector_search(&self, options: &VectorSearchOptions) -> Result<()> {
        if !self.vector_search {
            return Err(self.unsupported("vector search"));
        }
        self.check_constraints(&options.prefilters)?;
        Ok(())
    }

    pub fn check_batch(&self) -> Result<()> {
        if !self.atomic_batch {
            return Err(self.unsupported("atomic batched writes"));
        }
        Ok(())
    }

    pub fn check_transactions(&self) -> Result<()> {
        if !self.transactions {
            return Err(self.unsupported("transactions"));
        }
        Ok(())
    }

    pub fn check_realtime(&self) -> Result<()> {
        if !self.realtime {
            return Err(self.unsupported("realtime listeners"));
        }
        Ok(())
    }
}
