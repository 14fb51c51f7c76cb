//! Backend-neutral field values.
//!
//! Application code builds documents out of [`Value`]s and never sees a
//! backend's native representation. Dates are always `DateTime<Utc>`; the
//! adapters convert them to and from the native form on every path.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use gearshed_common::{Error, Result};

/// A document body: field name to value.
pub type Document = BTreeMap<String, Value>;

/// A field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Write-time transform, only valid inside write payloads.
    Field(FieldValue),
}

/// A number carried by `increment`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Integer(i64),
    Double(f64),
}

impl Numeric {
    /// Add this delta to an existing field value.
    ///
    /// A missing or non-numeric field counts as zero. Integer plus integer
    /// stays an integer (saturating); anything involving a double is a double.
    pub fn apply_to(self, current: Option<&Value>) -> Value {
        match (current, self) {
            (Some(Value::Integer(a)), Numeric::Integer(b)) => Value::Integer(a.saturating_add(b)),
            (Some(Value::Integer(a)), Numeric::Double(b)) => Value::Double(*a as f64 + b),
            (Some(Value::Double(a)), Numeric::Integer(b)) => Value::Double(a + b as f64),
            (Some(Value::Double(a)), Numeric::Double(b)) => Value::Double(a + b),
            (_, Numeric::Integer(b)) => Value::Integer(b),
            (_, Numeric::Double(b)) => Value::Double(b),
        }
    }
}

impl From<i64> for Numeric {
    fn from(n: i64) -> Self {
        Numeric::Integer(n)
    }
}

impl From<i32> for Numeric {
    fn from(n: i32) -> Self {
        Numeric::Integer(n as i64)
    }
}

impl From<f64> for Numeric {
    fn from(n: f64) -> Self {
        Numeric::Double(n)
    }
}

/// Write-time transforms resolved by the backend when a write commits.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// The commit time as seen by the backend.
    ServerTimestamp,
    /// Add to the current numeric value.
    Increment(Numeric),
    /// Append the values not already present.
    ArrayUnion(Vec<Value>),
    /// Remove every occurrence of the values.
    ArrayRemove(Vec<Value>),
    /// Remove the field.
    Delete,
}

impl FieldValue {
    pub fn server_timestamp() -> Value {
        Value::Field(FieldValue::ServerTimestamp)
    }

    pub fn increment(n: impl Into<Numeric>) -> Value {
        Value::Field(FieldValue::Increment(n.into()))
    }

    pub fn array_union<I, V>(values: I) -> Value
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::Field(FieldValue::ArrayUnion(
            values.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn array_remove<I, V>(values: I) -> Value
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::Field(FieldValue::ArrayRemove(
            values.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn delete() -> Value {
        Value::Field(FieldValue::Delete)
    }

    pub fn kind(&self) -> FieldValueKind {
        match self {
            Self::ServerTimestamp => FieldValueKind::ServerTimestamp,
            Self::Increment(_) => FieldValueKind::Increment,
            Self::ArrayUnion(_) => FieldValueKind::ArrayUnion,
            Self::ArrayRemove(_) => FieldValueKind::ArrayRemove,
            Self::Delete => FieldValueKind::Delete,
        }
    }

    /// Resolve the transform against the field's current value.
    ///
    /// Returns `None` when the field should be removed.
    pub fn resolve(&self, current: Option<&Value>, now: DateTime<Utc>) -> Option<Value> {
        match self {
            Self::ServerTimestamp => Some(Value::Timestamp(now)),
            Self::Increment(delta) => Some(delta.apply_to(current)),
            Self::ArrayUnion(values) => {
                let mut items = match current {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                for value in values {
                    if !items.contains(value) {
                        items.push(value.clone());
                    }
                }
                Some(Value::Array(items))
            }
            Self::ArrayRemove(values) => {
                let items = match current {
                    Some(Value::Array(items)) => items
                        .iter()
                        .filter(|item| !values.contains(item))
                        .cloned()
                        .collect(),
                    _ => Vec::new(),
                };
                Some(Value::Array(items))
            }
            Self::Delete => None,
        }
    }
}

/// The kinds of [`FieldValue`], used for capability declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldValueKind {
    ServerTimestamp,
    Increment,
    ArrayUnion,
    ArrayRemove,
    Delete,
}

impl FieldValueKind {
    pub const ALL: [FieldValueKind; 5] = [
        Self::ServerTimestamp,
        Self::Increment,
        Self::ArrayUnion,
        Self::ArrayRemove,
        Self::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerTimestamp => "serverTimestamp",
            Self::Increment => "increment",
            Self::ArrayUnion => "arrayUnion",
            Self::ArrayRemove => "arrayRemove",
            Self::Delete => "deleteField",
        }
    }
}

impl fmt::Display for FieldValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Value {
    /// Name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Timestamp(_) => "timestamp",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Field(_) => "field transform",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric value as a double, for integers and doubles alike.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(n) => Some(*n as f64),
            Self::Double(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Whether a field transform appears anywhere inside this value.
    pub fn contains_field_value(&self) -> bool {
        match self {
            Self::Field(_) => true,
            Self::Array(items) => items.iter().any(Value::contains_field_value),
            Self::Map(map) => map.values().any(Value::contains_field_value),
            _ => false,
        }
    }

    /// Collect the kinds of every field transform inside this value.
    pub fn collect_field_value_kinds(&self, out: &mut BTreeSet<FieldValueKind>) {
        match self {
            Self::Field(fv) => {
                out.insert(fv.kind());
            }
            Self::Array(items) => items.iter().for_each(|v| v.collect_field_value_kinds(out)),
            Self::Map(map) => map.values().for_each(|v| v.collect_field_value_kinds(out)),
            _ => {}
        }
    }

    /// Vector components, when this is an array of numbers.
    pub fn as_vector(&self) -> Option<Vec<f64>> {
        self.as_array()?.iter().map(Value::as_f64).collect()
    }

    /// Plain JSON rendering for display.
    ///
    /// Timestamps render as RFC 3339 strings and bytes as base64. Field
    /// transforms have no plain form and render as `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null | Self::Field(_) => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Integer(n) => serde_json::Value::from(*n),
            Self::Double(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => serde_json::Value::String(STANDARD.encode(b)),
            Self::Timestamp(ts) => {
                serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Self::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Build a value from plain JSON.
    ///
    /// Numbers that fit an `i64` become integers. Strings stay strings; no
    /// date sniffing is done.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Build a document from field/value pairs.
pub fn document<I, K, V>(fields: I) -> Document
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    fields
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Render a document as a plain JSON object.
pub fn document_to_json(doc: &Document) -> serde_json::Value {
    serde_json::Value::Object(doc.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

/// Build a document from a plain JSON object.
///
/// # Errors
/// - `json` is not an object
pub fn document_from_json(json: serde_json::Value) -> Result<Document> {
    match Value::from_json(json) {
        Value::Map(map) => Ok(map),
        other => Err(Error::InvalidInput(format!(
            "Document must be a JSON object, got {}",
            other.type_name()
        ))),
    }
}

/// Split a dotted field path into its segments.
///
/// # Errors
/// - The path or one of its segments is empty
pub fn field_path(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::InvalidInput(format!("Invalid field path '{}'", path)));
    }
    Ok(segments)
}

/// Look up a dotted field path inside a document.
pub fn get_field<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    lookup(doc, path.split('.'))
}

/// Look up a field by its segments; a segment may itself contain dots.
pub fn get_field_segments<'a>(doc: &'a Document, segments: &[&str]) -> Option<&'a Value> {
    lookup(doc, segments.iter().copied())
}

fn lookup<'a, 's>(
    doc: &'a Document,
    mut segments: impl Iterator<Item = &'s str>,
) -> Option<&'a Value> {
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_map()?.get(segment)?;
    }
    Some(current)
}

/// Set a dotted field path inside a document, creating intermediate maps.
///
/// A non-map value on the way is replaced by a map.
pub fn set_field(doc: &mut Document, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = doc;
    for segment in parents {
        let entry = current
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Map(BTreeMap::new()));
        if !matches!(entry, Value::Map(_)) {
            *entry = Value::Map(BTreeMap::new());
        }
        current = match entry {
            Value::Map(map) => map,
            _ => return,
        };
    }
    current.insert((*last).to_string(), value);
}

/// Remove a dotted field path from a document.
pub fn remove_field(doc: &mut Document, segments: &[&str]) -> Option<Value> {
    let (last, parents) = segments.split_last()?;
    let mut current = doc;
    for segment in parents {
        current = match current.get_mut(*segment)? {
            Value::Map(map) => map,
            _ => return None,
        };
    }
    current.remove(*last)
}

/// Deep-merge `incoming` into `base`: maps merge recursively, everything
/// else replaces.
pub fn merge_documents(base: &mut Document, incoming: Document) {
    for (key, value) in incoming {
        match (base.get_mut(&key), value) {
            (Some(Value::Map(existing)), Value::Map(update)) => merge_documents(existing, update),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// A backend's native timestamp, as it travels on that backend's wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NativeTimestamp(serde_json::Value);

impl NativeTimestamp {
    pub fn new(raw: serde_json::Value) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_raw(self) -> serde_json::Value {
        self.0
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i64 => Integer,
    i32 => Integer,
    u32 => Integer,
    f64 => Double,
    String => String,
    &str => String,
    DateTime<Utc> => Timestamp,
    Vec<Value> => Array,
    BTreeMap<String, Value> => Map,
    FieldValue => Field,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
