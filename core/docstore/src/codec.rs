//! Translation between the neutral value model and engine values.
//!
//! Dates become engine timestamps at any depth on the way in and turn back
//! into `DateTime<Utc>` on the way out. Field transforms are split out of the
//! write body into per-path transforms.

use chrono::{DateTime, Utc};
use serde_json::json;

use gearshed_backend::value::field_path;
use gearshed_backend::{
    Bound, CollectionPath, Direction, Document, FieldValue, FilterOp, NativeTimestamp, Numeric,
    QuerySpec, Value, WriteOperation,
};
use gearshed_common::{Error, Result};

use crate::engine::query::{FieldFilter, FieldOrder, Operator, StartCursor, StructuredQuery};
use crate::engine::store::{FieldTransform, Write, WriteKind};
use crate::engine::value::{assign, NativeMap, NativeValue, Timestamp, Transform};

/// Encode a plain value. Field transforms are rejected.
///
/// # Errors
/// - `InvalidInput` for a field transform at any depth
pub fn encode_value(value: &Value) -> Result<NativeValue> {
    Ok(match value {
        Value::Null => NativeValue::Null,
        Value::Bool(b) => NativeValue::Boolean(*b),
        Value::Integer(n) => NativeValue::Integer(*n),
        Value::Double(n) => NativeValue::Double(*n),
        Value::String(s) => NativeValue::String(s.clone()),
        Value::Bytes(b) => NativeValue::Bytes(b.clone()),
        Value::Timestamp(date) => NativeValue::Timestamp(Timestamp::from_datetime(*date)),
        Value::Array(items) => {
            NativeValue::Array(items.iter().map(encode_value).collect::<Result<_>>()?)
        }
        Value::Map(map) => NativeValue::Map(encode_map(map)?),
        Value::Field(field) => {
            return Err(Error::InvalidInput(format!(
                "{}() is only valid as a field of a write",
                field.kind()
            )))
        }
    })
}

fn encode_map(map: &Document) -> Result<NativeMap> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), encode_value(v)?)))
        .collect()
}

/// Decode an engine value.
///
/// # Errors
/// - `InvalidInput` for a timestamp outside the date range
pub fn decode_value(value: &NativeValue) -> Result<Value> {
    Ok(match value {
        NativeValue::Null => Value::Null,
        NativeValue::Boolean(b) => Value::Bool(*b),
        NativeValue::Integer(n) => Value::Integer(*n),
        NativeValue::Double(n) => Value::Double(*n),
        NativeValue::Timestamp(ts) => Value::Timestamp(ts.to_datetime()?),
        NativeValue::String(s) => Value::String(s.clone()),
        NativeValue::Bytes(b) => Value::Bytes(b.clone()),
        NativeValue::Array(items) => {
            Value::Array(items.iter().map(decode_value).collect::<Result<_>>()?)
        }
        NativeValue::Map(map) => Value::Map(decode_fields(map)?),
    })
}

pub fn decode_fields(fields: &NativeMap) -> Result<Document> {
    fields
        .iter()
        .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
        .collect()
}

/// The wire form of a timestamp: `{"seconds": .., "nanos": ..}`.
pub fn encode_timestamp(date: DateTime<Utc>) -> NativeTimestamp {
    let ts = Timestamp::from_datetime(date);
    NativeTimestamp::new(json!({ "seconds": ts.seconds, "nanos": ts.nanos }))
}

/// # Errors
/// - `InvalidInput` when the value is not a `{seconds, nanos}` object
pub fn decode_timestamp(timestamp: &NativeTimestamp) -> Result<DateTime<Utc>> {
    let ts: Timestamp = serde_json::from_value(timestamp.raw().clone()).map_err(|e| {
        Error::InvalidInput(format!("Not a document store timestamp: {}", e))
    })?;
    Timestamp::new(ts.seconds, ts.nanos)?.to_datetime()
}

fn split(path: &str) -> Result<Vec<String>> {
    Ok(field_path(path)?.into_iter().map(String::from).collect())
}

fn encode_transform(field: &FieldValue) -> Result<Option<Transform>> {
    Ok(match field {
        FieldValue::ServerTimestamp => Some(Transform::RequestTime),
        FieldValue::Increment(Numeric::Integer(n)) => {
            Some(Transform::Increment(NativeValue::Integer(*n)))
        }
        FieldValue::Increment(Numeric::Double(n)) => {
            Some(Transform::Increment(NativeValue::Double(*n)))
        }
        FieldValue::ArrayUnion(items) => Some(Transform::AppendMissing(
            items.iter().map(encode_value).collect::<Result<_>>()?,
        )),
        FieldValue::ArrayRemove(items) => Some(Transform::RemoveAll(
            items.iter().map(encode_value).collect::<Result<_>>()?,
        )),
        FieldValue::Delete => None,
    })
}

/// Accumulates the body, mask and transforms of one write.
#[derive(Default)]
struct WriteBody {
    fields: NativeMap,
    mask: Vec<Vec<String>>,
    transforms: Vec<FieldTransform>,
}

impl WriteBody {
    /// Walk a map of a `set`. With `masked`, every leaf joins the mask and
    /// `delete()` is allowed.
    fn walk(&mut self, map: &Document, prefix: &[String], masked: bool) -> Result<()> {
        for (key, value) in map {
            let mut path = prefix.to_vec();
            path.push(key.clone());

            match value {
                Value::Field(FieldValue::Delete) if masked => self.mask.push(path),
                Value::Field(FieldValue::Delete) => {
                    return Err(Error::InvalidInput(format!(
                        "delete() on '{}' requires update or set with merge",
                        path.join(".")
                    )))
                }
                Value::Field(field) => self.transform(path, field)?,
                Value::Map(inner) if !inner.is_empty() => {
                    if !masked {
                        assign(&mut self.fields, &path, NativeValue::Map(NativeMap::new()));
                    }
                    self.walk(inner, &path, masked)?;
                }
                other => {
                    assign(&mut self.fields, &path, encode_value(other)?);
                    if masked {
                        self.mask.push(path);
                    }
                }
            }
        }
        Ok(())
    }

    fn transform(&mut self, path: Vec<String>, field: &FieldValue) -> Result<()> {
        if let Some(transform) = encode_transform(field)? {
            self.transforms.push(FieldTransform {
                field: path,
                transform,
            });
        }
        Ok(())
    }

    /// Fields of an `update`: keys are dotted paths, map values replace
    /// the whole map.
    fn update(&mut self, fields: &Document) -> Result<()> {
        for (key, value) in fields {
            let path = split(key)?;
            match value {
                Value::Field(FieldValue::Delete) => self.mask.push(path),
                Value::Field(field) => self.transform(path, field)?,
                Value::Map(inner) => {
                    assign(&mut self.fields, &path, NativeValue::Map(NativeMap::new()));
                    self.mask.push(path.clone());
                    self.walk(inner, &path, false)?;
                }
                other => {
                    assign(&mut self.fields, &path, encode_value(other)?);
                    self.mask.push(path);
                }
            }
        }
        Ok(())
    }
}

/// Translate one write.
///
/// # Errors
/// - `InvalidInput` for a transform inside an array, `delete()` in a plain
///   `set`, or an invalid field path
pub fn encode_write(op: &WriteOperation) -> Result<Write> {
    let mut body = WriteBody::default();
    let kind = match op {
        WriteOperation::Set {
            data, merge: false, ..
        } => {
            body.walk(data, &[], false)?;
            WriteKind::Set(std::mem::take(&mut body.fields))
        }
        WriteOperation::Set {
            data, merge: true, ..
        } => {
            body.walk(data, &[], true)?;
            WriteKind::Merge {
                fields: std::mem::take(&mut body.fields),
                mask: std::mem::take(&mut body.mask),
            }
        }
        WriteOperation::Update { fields, .. } => {
            body.update(fields)?;
            WriteKind::Update {
                fields: std::mem::take(&mut body.fields),
                mask: std::mem::take(&mut body.mask),
            }
        }
        WriteOperation::Delete { .. } => WriteKind::Delete,
    };

    Ok(Write {
        path: op.path().clone(),
        kind,
        transforms: body.transforms,
    })
}

fn encode_operator(op: FilterOp) -> Operator {
    match op {
        FilterOp::Equal => Operator::Equal,
        FilterOp::NotEqual => Operator::NotEqual,
        FilterOp::LessThan => Operator::LessThan,
        FilterOp::LessThanOrEqual => Operator::LessThanOrEqual,
        FilterOp::GreaterThan => Operator::GreaterThan,
        FilterOp::GreaterThanOrEqual => Operator::GreaterThanOrEqual,
        FilterOp::ArrayContains => Operator::ArrayContains,
        FilterOp::ArrayContainsAny => Operator::ArrayContainsAny,
        FilterOp::In => Operator::In,
        FilterOp::NotIn => Operator::NotIn,
    }
}

/// Translate a normalized query on `collection`.
pub fn encode_query(collection: &CollectionPath, spec: &QuerySpec) -> Result<StructuredQuery> {
    let mut query = StructuredQuery::collection(collection.clone());

    for filter in &spec.filters {
        query.filters.push(FieldFilter {
            field: split(&filter.field)?,
            op: encode_operator(filter.op),
            value: encode_value(&filter.value)?,
        });
    }
    for order in &spec.orders {
        query.orders.push(FieldOrder {
            field: split(&order.field)?,
            descending: order.direction == Direction::Descending,
        });
    }
    query.limit = spec.limit;
    if let Some(Bound {
        values,
        document_id,
        inclusive,
    }) = &spec.start
    {
        query.start = Some(StartCursor {
            values: values.iter().map(encode_value).collect::<Result<_>>()?,
            document_id: document_id.clone(),
            inclusive: *inclusive,
        });
    }

    Ok(query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gearshed_backend::{document, DocumentPath, QueryConstraint};
    use proptest::prelude::*;

    fn path() -> DocumentPath {
        DocumentPath::new("bikes", "b1").unwrap()
    }

    #[test]
    fn test_nested_dates_roundtrip() {
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let value = Value::Map(document([
            ("bought", Value::Timestamp(date)),
            (
                "services",
                Value::Array(vec![Value::Map(document([("at", Value::Timestamp(date))]))]),
            ),
        ]));

        let native = encode_value(&value).unwrap();
        let NativeValue::Map(map) = &native else {
            panic!("expected map");
        };
        assert!(matches!(map.get("bought"), Some(NativeValue::Timestamp(_))));
        assert_eq!(decode_value(&native).unwrap(), value);
    }

    #[test]
    fn test_set_splits_transforms() {
        let write = encode_write(&WriteOperation::Set {
            path: path(),
            data: document([
                ("name", Value::from("trail")),
                ("meta", Value::Map(document([("at", FieldValue::server_timestamp())]))),
            ]),
            merge: false,
        })
        .unwrap();

        let WriteKind::Set(fields) = &write.kind else {
            panic!("expected set");
        };
        assert_eq!(fields.get("name"), Some(&NativeValue::String("trail".into())));
        assert_eq!(fields.get("meta"), Some(&NativeValue::Map(NativeMap::new())));
        assert_eq!(
            write.transforms,
            vec![FieldTransform {
                field: vec!["meta".into(), "at".into()],
                transform: Transform::RequestTime,
            }]
        );
    }

    #[test]
    fn test_merge_mask_is_leaf_paths() {
        let write = encode_write(&WriteOperation::Set {
            path: path(),
            data: document([
                ("specs", Value::Map(document([("wheel", Value::from(29))]))),
                ("old", FieldValue::delete()),
            ]),
            merge: true,
        })
        .unwrap();

        let WriteKind::Merge { mask, .. } = &write.kind else {
            panic!("expected merge");
        };
        assert_eq!(
            mask,
            &vec![vec!["old".to_string()], vec!["specs".to_string(), "wheel".to_string()]]
        );
    }

    #[test]
    fn test_update_dotted_paths() {
        let write = encode_write(&WriteOperation::Update {
            path: path(),
            fields: document([
                ("specs.wheel", Value::from(27)),
                ("km", FieldValue::increment(5)),
            ]),
        })
        .unwrap();

        let WriteKind::Update { fields, mask } = &write.kind else {
            panic!("expected update");
        };
        assert_eq!(mask, &vec![vec!["specs".to_string(), "wheel".to_string()]]);
        assert!(matches!(fields.get("specs"), Some(NativeValue::Map(m)) if m.len() == 1));
        assert_eq!(write.transforms.len(), 1);
    }

    #[test]
    fn test_rejected_writes() {
        let in_array = WriteOperation::Set {
            path: path(),
            data: document([("tags", Value::Array(vec![FieldValue::server_timestamp()]))]),
            merge: false,
        };
        assert!(matches!(encode_write(&in_array), Err(Error::InvalidInput(_))));

        let delete_in_set = WriteOperation::Set {
            path: path(),
            data: document([("old", FieldValue::delete())]),
            merge: false,
        };
        assert!(matches!(encode_write(&delete_in_set), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_encode_query() {
        let spec = QuerySpec::from_constraints(&[
            QueryConstraint::where_("specs.wheel", FilterOp::GreaterThan, 26),
            QueryConstraint::order_by("specs.wheel", Direction::Descending),
            QueryConstraint::limit(3),
        ])
        .unwrap();
        let query = encode_query(&CollectionPath::new("bikes").unwrap(), &spec).unwrap();
        assert_eq!(query.filters[0].field, vec!["specs", "wheel"]);
        assert_eq!(query.filters[0].op, Operator::GreaterThan);
        assert!(query.orders[0].descending);
        assert_eq!(query.limit, Some(3));
    }

    proptest! {
        #[test]
        fn prop_timestamp_roundtrip(seconds in -62_135_596_800i64..253_402_300_799, nanos in 0u32..1_000_000_000) {
            let date = Utc.timestamp_opt(seconds, nanos).single().unwrap();
            prop_assert_eq!(decode_timestamp(&encode_timestamp(date)).unwrap(), date);
            prop_assert_eq!(decode_value(&encode_value(&Value::Timestamp(date)).unwrap()).unwrap(), Value::Timestamp(date));
        }
    }
}
