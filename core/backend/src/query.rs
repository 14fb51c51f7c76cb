//! Query constraints and their normalized form.

use std::fmt;
use std::str::FromStr;

use gearshed_common::{Error, Result};

use crate::snapshot::DocumentSnapshot;
use crate::value::{field_path, Value};

/// Comparison operator of a `where` constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOp {
    pub const ALL: [FilterOp; 10] = [
        Self::Equal,
        Self::NotEqual,
        Self::LessThan,
        Self::LessThanOrEqual,
        Self::GreaterThan,
        Self::GreaterThanOrEqual,
        Self::ArrayContains,
        Self::ArrayContainsAny,
        Self::In,
        Self::NotIn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::ArrayContains => "array-contains",
            Self::ArrayContainsAny => "array-contains-any",
            Self::In => "in",
            Self::NotIn => "not-in",
        }
    }

    /// Operators whose operand is a list of values.
    pub fn takes_list(&self) -> bool {
        matches!(self, Self::In | Self::NotIn | Self::ArrayContainsAny)
    }

    /// Operators that test membership in an array field.
    pub fn is_array_membership(&self) -> bool {
        matches!(self, Self::ArrayContains | Self::ArrayContainsAny)
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown filter operator '{}'", s)))
    }
}

/// Sort direction of an `orderBy` constraint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ascending => "asc",
            Self::Descending => "desc",
        }
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "asc" => Ok(Self::Ascending),
            "desc" => Ok(Self::Descending),
            other => Err(Error::InvalidInput(format!(
                "Unknown sort direction '{}'",
                other
            ))),
        }
    }
}

/// Where a paginated query starts.
#[derive(Debug, Clone, PartialEq)]
pub enum Cursor {
    /// Values for the leading order-by fields.
    Values(Vec<Value>),
    /// A document read earlier; its order-by values and id locate the start.
    Snapshot(DocumentSnapshot),
}

/// One constraint of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryConstraint {
    Where {
        field: String,
        op: FilterOp,
        value: Value,
    },
    OrderBy {
        field: String,
        direction: Direction,
    },
    Limit(usize),
    StartAfter(Cursor),
    StartAt(Cursor),
}

impl QueryConstraint {
    pub fn where_(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self::Where {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn order_by(field: impl Into<String>, direction: Direction) -> Self {
        Self::OrderBy {
            field: field.into(),
            direction,
        }
    }

    pub fn limit(n: usize) -> Self {
        Self::Limit(n)
    }

    pub fn start_after_values(values: Vec<Value>) -> Self {
        Self::StartAfter(Cursor::Values(values))
    }

    pub fn start_after(snapshot: DocumentSnapshot) -> Self {
        Self::StartAfter(Cursor::Snapshot(snapshot))
    }

    pub fn start_at_values(values: Vec<Value>) -> Self {
        Self::StartAt(Cursor::Values(values))
    }
}

/// A normalized `where` constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    /// The operand list of `in`, `not-in` and `array-contains-any`.
    pub fn values(&self) -> &[Value] {
        self.value.as_array().unwrap_or_default()
    }
}

/// A normalized `orderBy` constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

/// Start position of a paginated query.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    /// Values for the first `values.len()` order-by fields.
    pub values: Vec<Value>,
    /// Tie breaker when the cursor came from a snapshot.
    pub document_id: Option<String>,
    /// `startAt` includes the bound, `startAfter` does not.
    pub inclusive: bool,
}

/// A query in normalized form, checked for structural mistakes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySpec {
    pub filters: Vec<Filter>,
    pub orders: Vec<Order>,
    pub limit: Option<usize>,
    pub start: Option<Bound>,
}

impl QuerySpec {
    /// Normalize a constraint list.
    ///
    /// # Errors
    /// - Invalid field path
    /// - A field transform used as a filter operand
    /// - A list operator without a non-empty array operand
    /// - More than one `limit` or more than one start cursor
    /// - A cursor without an `orderBy`, or with more values than order-bys
    /// - A snapshot cursor for a missing document or lacking an order-by field
    pub fn from_constraints(constraints: &[QueryConstraint]) -> Result<Self> {
        let mut spec = QuerySpec::default();
        let mut cursor: Option<(&Cursor, bool)> = None;

        for constraint in constraints {
            match constraint {
                QueryConstraint::Where { field, op, value } => {
                    field_path(field)?;
                    if value.contains_field_value() {
                        return Err(Error::InvalidInput(format!(
                            "Field transforms cannot be used in a '{}' filter on '{}'",
                            op, field
                        )));
                    }
                    if op.takes_list() {
                        match value {
                            Value::Array(items) if !items.is_empty() => {}
                            _ => {
                                return Err(Error::InvalidInput(format!(
                                    "'{}' filter on '{}' requires a non-empty array",
                                    op, field
                                )))
                            }
                        }
                    }
                    spec.filters.push(Filter {
                        field: field.clone(),
                        op: *op,
                        value: value.clone(),
                    });
                }
                QueryConstraint::OrderBy { field, direction } => {
                    field_path(field)?;
                    spec.orders.push(Order {
                        field: field.clone(),
                        direction: *direction,
                    });
                }
                QueryConstraint::Limit(n) => {
                    if spec.limit.replace(*n).is_some() {
                        return Err(Error::InvalidInput(
                            "A query accepts a single limit".to_string(),
                        ));
                    }
                }
                QueryConstraint::StartAfter(c) | QueryConstraint::StartAt(c) => {
                    let inclusive = matches!(constraint, QueryConstraint::StartAt(_));
                    if cursor.replace((c, inclusive)).is_some() {
                        return Err(Error::InvalidInput(
                            "A query accepts a single start cursor".to_string(),
                        ));
                    }
                }
            }
        }

        if let Some((c, inclusive)) = cursor {
            spec.start = Some(spec.bound_for(c, inclusive)?);
        }

        Ok(spec)
    }

    fn bound_for(&self, cursor: &Cursor, inclusive: bool) -> Result<Bound> {
        if self.orders.is_empty() {
            return Err(Error::InvalidInput(
                "A start cursor requires at least one orderBy".to_string(),
            ));
        }

        match cursor {
            Cursor::Values(values) => {
                if values.is_empty() || values.len() > self.orders.len() {
                    return Err(Error::InvalidInput(format!(
                        "Cursor has {} values for {} orderBy fields",
                        values.len(),
                        self.orders.len()
                    )));
                }
                Ok(Bound {
                    values: values.clone(),
                    document_id: None,
                    inclusive,
                })
            }
            Cursor::Snapshot(snapshot) => {
                if !snapshot.exists() {
                    return Err(Error::InvalidInput(format!(
                        "Cannot start a query at missing document '{}'",
                        snapshot.path()
                    )));
                }
                let values = self
                    .orders
                    .iter()
                    .map(|order| {
                        snapshot.get(&order.field).cloned().ok_or_else(|| {
                            Error::InvalidInput(format!(
                                "Cursor document '{}' has no field '{}'",
                                snapshot.path(),
                                order.field
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Bound {
                    values,
                    document_id: Some(snapshot.id().to_string()),
                    inclusive,
                })
            }
        }
    }

    /// Number of array-membership filters.
    pub fn array_membership_filters(&self) -> usize {
        self.filters
            .iter()
            .filter(|f| f.op.is_array_membership())
            .count()
    }
}
