//! Write semantics on neutral documents.
//!
//! The relational engine stores whole documents, so `set`, merge and
//! `update` are resolved here against the current body, field transforms
//! included, inside the engine's write transaction.

use chrono::{DateTime, Utc};

use gearshed_backend::value::{field_path, get_field_segments, remove_field, set_field};
use gearshed_backend::{Document, FieldValue, Value, WriteOperation};
use gearshed_common::{Error, Result};

/// The document body after `op`; `None` deletes the document.
///
/// # Errors
/// - `NotFound` for an update of a missing document
/// - `InvalidInput` for a transform inside an array, `delete()` in a plain
///   set, or an invalid field path
pub fn apply_write(
    current: Option<Document>,
    op: &WriteOperation,
    now: DateTime<Utc>,
) -> Result<Option<Document>> {
    match op {
        WriteOperation::Delete { .. } => Ok(None),
        WriteOperation::Set {
            data, merge: false, ..
        } => {
            let mut doc = Document::new();
            write_map(&mut doc, data, &[], now, false)?;
            Ok(Some(doc))
        }
        WriteOperation::Set {
            data, merge: true, ..
        } => {
            let mut doc = current.unwrap_or_default();
            write_map(&mut doc, data, &[], now, true)?;
            Ok(Some(doc))
        }
        WriteOperation::Update { path, fields } => {
            let mut doc = current
                .ok_or_else(|| Error::NotFound(format!("No document to update: {}", path)))?;
            for (key, value) in fields {
                let segments = field_path(key)?;
                match value {
                    Value::Field(field) => apply_field_value(&mut doc, &segments, field, now),
                    Value::Map(inner) => {
                        set_field(&mut doc, &segments, Value::Map(Document::new()));
                        write_map(&mut doc, inner, &segments, now, false)?;
                    }
                    other => {
                        reject_nested_transforms(other, key)?;
                        set_field(&mut doc, &segments, other.clone());
                    }
                }
            }
            Ok(Some(doc))
        }
    }
}

/// Write the leaves of `map` under `prefix`. `merge` allows `delete()` and
/// keeps sibling fields of nested maps.
fn write_map<'a>(
    doc: &mut Document,
    map: &'a Document,
    prefix: &[&'a str],
    now: DateTime<Utc>,
    merge: bool,
) -> Result<()> {
    for (key, value) in map {
        let mut path = prefix.to_vec();
        path.push(key.as_str());

        match value {
            Value::Field(FieldValue::Delete) if !merge => {
                return Err(Error::InvalidInput(format!(
                    "delete() on '{}' requires update or set with merge",
                    path.join(".")
                )))
            }
            Value::Field(field) => apply_field_value(doc, &path, field, now),
            Value::Map(inner) if !inner.is_empty() => {
                if !merge || !matches!(get_field_segments(doc, &path), Some(Value::Map(_))) {
                    set_field(doc, &path, Value::Map(Document::new()));
                }
                write_map(doc, inner, &path, now, merge)?;
            }
            other => {
                reject_nested_transforms(other, key)?;
                set_field(doc, &path, other.clone());
            }
        }
    }
    Ok(())
}

fn apply_field_value(doc: &mut Document, path: &[&str], field: &FieldValue, now: DateTime<Utc>) {
    let current = get_field_segments(doc, path);
    match field.resolve(current, now) {
        Some(value) => set_field(doc, path, value),
        None => {
            remove_field(doc, path);
        }
    }
}

fn reject_nested_transforms(value: &Value, key: &str) -> Result<()> {
    if value.contains_field_value() {
        return Err(Error::InvalidInput(format!(
            "Field transforms are not supported inside arrays ('{}')",
            key
        )));
    }
    Ok(())
}
