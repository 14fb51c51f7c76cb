//! Document database capability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use gearshed_common::{CollectionPath, DocumentPath, Error, ExecutionContext, Result};

use crate::batch::{Precondition, SetOptions, WriteOperation};
use crate::capabilities::Capabilities;
use crate::ids::auto_id;
use crate::query::QueryConstraint;
use crate::snapshot::{DocumentSnapshot, QuerySnapshot};
use crate::subscription::ListenerRegistration;
use crate::value::{Document, NativeTimestamp};

/// Receives every change of a watched document.
pub type DocumentCallback = Box<dyn Fn(DocumentSnapshot) + Send + Sync>;

/// Receives every change of a watched query's results.
pub type QueryCallback = Box<dyn Fn(QuerySnapshot) + Send + Sync>;

/// Document database operations.
///
/// Paths may be top-level (`bikes/b1`) or nested under a parent document
/// (`bikes/b1/components/c1`). Single-document writes go through
/// [`Database::commit`] by default so every write path shares one
/// translation.
#[async_trait]
pub trait Database: Send + Sync {
    /// Name of the backend, e.g. `docstore`.
    fn backend(&self) -> &'static str;

    fn context(&self) -> ExecutionContext;

    fn capabilities(&self) -> &Capabilities;

    /// Read one document. A missing document is a snapshot with no data.
    async fn get_doc(&self, path: &DocumentPath) -> Result<DocumentSnapshot>;

    /// Read the documents of a collection matching `constraints`.
    async fn get_docs(
        &self,
        collection: &CollectionPath,
        constraints: &[QueryConstraint],
    ) -> Result<QuerySnapshot>;

    /// Create or overwrite a document, or merge into it with `options.merge`.
    async fn set_doc(&self, path: &DocumentPath, data: Document, options: SetOptions) -> Result<()> {
        self.commit(
            vec![WriteOperation::Set {
                path: path.clone(),
                data,
                merge: options.merge,
            }],
            Vec::new(),
        )
        .await
    }

    /// Change fields of an existing document.
    ///
    /// # Errors
    /// - `NotFound` if the document does not exist
    async fn update_doc(&self, path: &DocumentPath, fields: Document) -> Result<()> {
        self.commit(
            vec![WriteOperation::Update {
                path: path.clone(),
                fields,
            }],
            Vec::new(),
        )
        .await
    }

    /// Delete a document. Deleting a missing document succeeds.
    async fn delete_doc(&self, path: &DocumentPath) -> Result<()> {
        self.commit(vec![WriteOperation::Delete { path: path.clone() }], Vec::new())
            .await
    }

    /// Create a document with a generated id.
    async fn add_doc(&self, collection: &CollectionPath, data: Document) -> Result<DocumentPath> {
        let path = collection.doc(self.generate_id())?;
        self.set_doc(&path, data, SetOptions::default()).await?;
        Ok(path)
    }

    /// Watch one document. The callback receives the current state first.
    fn on_doc_snapshot(
        &self,
        path: &DocumentPath,
        callback: DocumentCallback,
    ) -> Result<ListenerRegistration>;

    /// Watch a query. The callback receives the current results first.
    fn on_query_snapshot(
        &self,
        collection: &CollectionPath,
        constraints: &[QueryConstraint],
        callback: QueryCallback,
    ) -> Result<ListenerRegistration>;

    /// Apply writes atomically, provided every precondition holds.
    ///
    /// # Errors
    /// - `Conflict` when a precondition fails
    /// - `NotFound` when an update targets a missing document
    async fn commit(
        &self,
        writes: Vec<WriteOperation>,
        preconditions: Vec<Precondition>,
    ) -> Result<()>;

    /// A fresh 20 character document id.
    fn generate_id(&self) -> String {
        auto_id()
    }

    /// Nearest-neighbour search over a vector field.
    async fn find_nearest(&self, options: &VectorSearchOptions) -> Result<QuerySnapshot>;

    /// Convert a date to the backend's native timestamp.
    fn encode_timestamp(&self, date: DateTime<Utc>) -> NativeTimestamp;

    /// Convert a native timestamp back to a date.
    fn decode_timestamp(&self, timestamp: &NativeTimestamp) -> Result<DateTime<Utc>>;
}

/// Distance function of a vector search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DistanceMeasure {
    #[default]
    Cosine,
    Euclidean,
    DotProduct,
}

impl DistanceMeasure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "COSINE",
            Self::Euclidean => "EUCLIDEAN",
            Self::DotProduct => "DOT_PRODUCT",
        }
    }

    /// Distance between two vectors; `None` when the dimensions differ or a
    /// cosine operand has zero length.
    pub fn distance(&self, a: &[f64], b: &[f64]) -> Option<f64> {
        if a.len() != b.len() || a.is_empty() {
            return None;
        }
        let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        match self {
            Self::DotProduct => Some(dot),
            Self::Euclidean => Some(
                a.iter()
                    .zip(b)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f64>()
                    .sqrt(),
            ),
            Self::Cosine => {
                let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
                let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    return None;
                }
                Some(1.0 - dot / (norm_a * norm_b))
            }
        }
    }

    /// Whether a larger value means closer.
    pub fn higher_is_closer(&self) -> bool {
        matches!(self, Self::DotProduct)
    }

    /// Whether `distance` passes a threshold.
    pub fn within(&self, distance: f64, threshold: f64) -> bool {
        if self.higher_is_closer() {
            distance >= threshold
        } else {
            distance <= threshold
        }
    }
}

impl fmt::Display for DistanceMeasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMeasure {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "COSINE" => Ok(Self::Cosine),
            "EUCLIDEAN" => Ok(Self::Euclidean),
            "DOT_PRODUCT" => Ok(Self::DotProduct),
            other => Err(Error::InvalidInput(format!(
                "Unknown distance measure '{}'",
                other
            ))),
        }
    }
}

/// Most neighbours a vector search returns.
pub const MAX_VECTOR_LIMIT: usize = 1000;

/// Parameters of a nearest-neighbour search.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSearchOptions {
    pub collection: CollectionPath,
    pub vector_field: String,
    pub query_vector: Vec<f64>,
    pub limit: usize,
    pub distance_measure: DistanceMeasure,
    /// Field that receives each result's distance.
    pub distance_result_field: Option<String>,
    /// Results farther than this are dropped.
    pub distance_threshold: Option<f64>,
    /// Filters applied before ranking.
    pub prefilters: Vec<QueryConstraint>,
}

impl VectorSearchOptions {
    pub fn new(
        collection: CollectionPath,
        vector_field: impl Into<String>,
        query_vector: Vec<f64>,
        limit: usize,
    ) -> Self {
        Self {
            collection,
            vector_field: vector_field.into(),
            query_vector,
            limit,
            distance_measure: DistanceMeasure::default(),
            distance_result_field: None,
            distance_threshold: None,
            prefilters: Vec::new(),
        }
    }

    pub fn with_distance_measure(mut self, measure: DistanceMeasure) -> Self {
        self.distance_measure = measure;
        self
    }

    pub fn with_distance_result_field(mut self, field: impl Into<String>) -> Self {
        self.distance_result_field = Some(field.into());
        self
    }

    pub fn with_distance_threshold(mut self, threshold: f64) -> Self {
        self.distance_threshold = Some(threshold);
        self
    }

    pub fn with_prefilter(mut self, constraint: QueryConstraint) -> Self {
        self.prefilters.push(constraint);
        self
    }

    /// # Errors
    /// - Empty or non-finite query vector
    /// - Limit of zero or above [`MAX_VECTOR_LIMIT`]
    pub fn validate(&self) -> Result<()> {
        if self.query_vector.is_empty() || self.query_vector.iter().any(|x| !x.is_finite()) {
            return Err(Error::InvalidInput(
                "Query vector must be non-empty and finite".to_string(),
            ));
        }
        if self.limit == 0 || self.limit > MAX_VECTOR_LIMIT {
            return Err(Error::InvalidInput(format!(
                "Vector search limit must be between 1 and {}",
                MAX_VECTOR_LIMIT
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distances() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        assert_eq!(DistanceMeasure::DotProduct.distance(&a, &b), Some(0.0));
        assert_eq!(DistanceMeasure::Cosine.distance(&a, &a), Some(0.0));
        assert_eq!(DistanceMeasure::Cosine.distance(&a, &b), Some(1.0));
        let euclid = DistanceMeasure::Euclidean.distance(&a, &b).unwrap();
        assert!((euclid - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(DistanceMeasure::Euclidean.distance(&a, &[1.0]), None);
        assert_eq!(DistanceMeasure::Cosine.distance(&a, &[0.0, 0.0]), None);
    }

    #[test]
    fn test_threshold_direction() {
        assert!(DistanceMeasure::Euclidean.within(0.5, 1.0));
        assert!(!DistanceMeasure::Euclidean.within(1.5, 1.0));
        assert!(DistanceMeasure::DotProduct.within(1.5, 1.0));
        assert!(!DistanceMeasure::DotProduct.within(0.5, 1.0));
    }

    #[test]
    fn test_validate_options() {
        let parts = CollectionPath::new("parts").unwrap();
        assert!(VectorSearchOptions::new(parts.clone(), "v", vec![1.0], 3)
            .validate()
            .is_ok());
        assert!(VectorSearchOptions::new(parts.clone(), "v", vec![], 3)
            .validate()
            .is_err());
        assert!(VectorSearchOptions::new(parts, "v", vec![1.0], 0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_measure_parse() {
        assert_eq!("cosine".parse::<DistanceMeasure>().unwrap(), DistanceMeasure::Cosine);
        assert_eq!(
            "DOT_PRODUCT".parse::<DistanceMeasure>().unwrap(),
            DistanceMeasure::DotProduct
        );
        assert!("manhattan".parse::<DistanceMeasure>().is_err());
    }
}
