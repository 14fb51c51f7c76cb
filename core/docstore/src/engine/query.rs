//! Query evaluation over stored documents.

use std::cmp::Ordering;

use gearshed_common::CollectionPath;

use super::value::{lookup, NativeMap, NativeValue};

/// Filter operators understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
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

#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: Vec<String>,
    pub op: Operator,
    pub value: NativeValue,
}

impl FieldFilter {
    /// Whether a document's fields satisfy the filter.
    ///
    /// Range and inequality operators only match values of the operand's
    /// type class; `!=` and `not-in` never match a missing or null field.
    pub fn matches(&self, fields: &NativeMap) -> bool {
        let Some(actual) = lookup(fields, &self.field) else {
            return false;
        };

        match self.op {
            Operator::Equal => actual == &self.value,
            Operator::NotEqual => !actual.is_null() && actual != &self.value,
            Operator::LessThan => self.range(actual, |o| o == Ordering::Less),
            Operator::LessThanOrEqual => self.range(actual, |o| o != Ordering::Greater),
            Operator::GreaterThan => self.range(actual, |o| o == Ordering::Greater),
            Operator::GreaterThanOrEqual => self.range(actual, |o| o != Ordering::Less),
            Operator::ArrayContains => actual
                .as_array()
                .is_some_and(|items| items.contains(&self.value)),
            Operator::ArrayContainsAny => {
                let wanted = self.value.as_array().unwrap_or_default();
                actual
                    .as_array()
                    .is_some_and(|items| items.iter().any(|item| wanted.contains(item)))
            }
            Operator::In => self
                .value
                .as_array()
                .is_some_and(|options| options.contains(actual)),
            Operator::NotIn => {
                !actual.is_null()
                    && self
                        .value
                        .as_array()
                        .is_some_and(|options| !options.contains(actual))
            }
        }
    }

    fn range(&self, actual: &NativeValue, accept: impl Fn(Ordering) -> bool) -> bool {
        actual.same_type_class(&self.value) && accept(actual.total_cmp(&self.value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldOrder {
    pub field: Vec<String>,
    pub descending: bool,
}

/// Start position: order-by values, optionally a document id tie breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct StartCursor {
    pub values: Vec<NativeValue>,
    pub document_id: Option<String>,
    /// Include documents equal to the cursor (`startAt`).
    pub inclusive: bool,
}

/// A structured query against one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredQuery {
    pub collection: CollectionPath,
    pub filters: Vec<FieldFilter>,
    pub orders: Vec<FieldOrder>,
    pub limit: Option<usize>,
    pub start: Option<StartCursor>,
}

impl StructuredQuery {
    pub fn collection(collection: CollectionPath) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            orders: Vec::new(),
            limit: None,
            start: None,
        }
    }

    /// Whether a document passes every filter and has every order-by field.
    pub fn matches(&self, fields: &NativeMap) -> bool {
        self.filters.iter().all(|f| f.matches(fields))
            && self
                .orders
                .iter()
                .all(|o| lookup(fields, &o.field).is_some())
    }

    /// Sort order: the order-bys, then document id in the direction of the
    /// last order-by.
    pub fn compare(&self, a: (&str, &NativeMap), b: (&str, &NativeMap)) -> Ordering {
        for order in &self.orders {
            let ord = compare_field(a.1, b.1, &order.field);
            let ord = if order.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        let by_id = a.0.cmp(b.0);
        if self.ids_descending() {
            by_id.reverse()
        } else {
            by_id
        }
    }

    fn ids_descending(&self) -> bool {
        self.orders.last().is_some_and(|o| o.descending)
    }

    /// Whether a document lies at or after the start cursor.
    pub fn after_start(&self, id: &str, fields: &NativeMap) -> bool {
        let Some(cursor) = &self.start else {
            return true;
        };

        for (order, bound) in self.orders.iter().zip(&cursor.values) {
            let ord = match lookup(fields, &order.field) {
                Some(value) => value.total_cmp(bound),
                None => Ordering::Less,
            };
            let ord = if order.descending { ord.reverse() } else { ord };
            match ord {
                Ordering::Greater => return true,
                Ordering::Less => return false,
                Ordering::Equal => {}
            }
        }

        if let Some(bound_id) = &cursor.document_id {
            let ord = id.cmp(bound_id.as_str());
            let ord = if self.ids_descending() { ord.reverse() } else { ord };
            match ord {
                Ordering::Greater => return true,
                Ordering::Less => return false,
                Ordering::Equal => {}
            }
        }

        cursor.inclusive
    }

    /// Filter, sort, apply the cursor and limit.
    pub fn run<'a, I>(&self, docs: I) -> Vec<(&'a str, &'a NativeMap)>
    where
        I: IntoIterator<Item = (&'a str, &'a NativeMap)>,
    {
        let mut hits: Vec<_> = docs
            .into_iter()
            .filter(|(_, fields)| self.matches(fields))
            .collect();
        hits.sort_by(|a, b| self.compare(*a, *b));
        hits.retain(|(id, fields)| self.after_start(id, fields));
        if let Some(limit) = self.limit {
            hits.truncate(limit);
        }
        hits
    }
}

fn compare_field(a: &NativeMap, b: &NativeMap, field: &[String]) -> Ordering {
    match (lookup(a, field), lookup(b, field)) {
        (Some(x), Some(y)) => x.total_cmp(y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
