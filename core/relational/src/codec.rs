//! Translation between the neutral value model and stored JSON.
//!
//! Documents are stored as JSON text. Values JSON cannot carry are tagged
//! objects: `{"$date": "<RFC 3339, nanoseconds, UTC>"}` and
//! `{"$binary": "<base64>"}`. A user map holding one of the tag keys is
//! stored as `{"$map": {...}}` so it is never read back as a tagged value.
//! Fixed-width date text sorts in time order.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Number};

use gearshed_backend::{Document, NativeTimestamp, Value};
use gearshed_common::{Error, Result};

pub const DATE_TAG: &str = "$date";
pub const BINARY_TAG: &str = "$binary";
pub const MAP_TAG: &str = "$map";

fn is_tag(key: &str) -> bool {
    matches!(key, DATE_TAG | BINARY_TAG | MAP_TAG)
}

/// The stored text form of a date.
pub fn format_date(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// # Errors
/// - `InvalidInput` for text that is not an RFC 3339 date
pub fn parse_date(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::InvalidInput(format!("Invalid stored date '{}': {}", text, e)))
}

/// Encode a plain value as stored JSON.
///
/// # Errors
/// - `InvalidInput` for a field transform or a non-finite number
pub fn encode_value(value: &Value) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Integer(n) => json!(n),
        Value::Double(n) => Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or_else(|| {
                Error::InvalidInput(format!("Cannot store non-finite number {}", n))
            })?,
        Value::String(s) => json!(s),
        Value::Bytes(b) => json!({ BINARY_TAG: STANDARD.encode(b) }),
        Value::Timestamp(date) => json!({ DATE_TAG: format_date(*date) }),
        Value::Array(items) => serde_json::Value::Array(
            items.iter().map(encode_value).collect::<Result<_>>()?,
        ),
        Value::Map(map) if map.keys().any(|k| is_tag(k)) => {
            json!({ MAP_TAG: serde_json::Value::Object(encode_object(map)?) })
        }
        Value::Map(map) => serde_json::Value::Object(encode_object(map)?),
        Value::Field(field) => {
            return Err(Error::InvalidInput(format!(
                "{}() cannot be stored as a value",
                field.kind()
            )))
        }
    })
}

fn encode_object(map: &Document) -> Result<Map<String, serde_json::Value>> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), encode_value(v)?)))
        .collect()
}

/// Encode a document as JSON text.
pub fn encode_document(doc: &Document) -> Result<String> {
    Ok(serde_json::Value::Object(encode_object(doc)?).to_string())
}

/// Decode stored JSON, restoring dates and bytes at any depth.
///
/// # Errors
/// - `InvalidInput` for a malformed tagged value
pub fn decode_value(json: &serde_json::Value) -> Result<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => {
            Value::Array(items.iter().map(decode_value).collect::<Result<_>>()?)
        }
        serde_json::Value::Object(map) => match tagged(map) {
            Some((DATE_TAG, serde_json::Value::String(text))) => Value::Timestamp(parse_date(text)?),
            Some((BINARY_TAG, serde_json::Value::String(b64))) => {
                Value::Bytes(STANDARD.decode(b64).map_err(|e| {
                    Error::InvalidInput(format!("Invalid stored binary value: {}", e))
                })?)
            }
            Some((MAP_TAG, serde_json::Value::Object(inner))) => {
                Value::Map(decode_object(inner)?)
            }
            _ => Value::Map(decode_object(map)?),
        },
    })
}

/// The single tag entry of a tagged object.
fn tagged(map: &Map<String, serde_json::Value>) -> Option<(&str, &serde_json::Value)> {
    if map.len() != 1 {
        return None;
    }
    let (key, value) = map.iter().next()?;
    match key.as_str() {
        DATE_TAG => Some((DATE_TAG, value)),
        BINARY_TAG => Some((BINARY_TAG, value)),
        MAP_TAG => Some((MAP_TAG, value)),
        _ => None,
    }
}

fn decode_object(map: &Map<String, serde_json::Value>) -> Result<Document> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
        .collect()
}

/// Decode JSON text of a stored document.
///
/// # Errors
/// - `Serialization` for text that is not a JSON object
pub fn decode_document(text: &str) -> Result<Document> {
    match serde_json::from_str::<serde_json::Value>(text)? {
        serde_json::Value::Object(map) => decode_object(&map),
        _ => Err(Error::Serialization(
            "Stored document is not a JSON object".to_string(),
        )),
    }
}

/// The wire form of a timestamp: RFC 3339 text with nanoseconds.
pub fn encode_timestamp(date: DateTime<Utc>) -> NativeTimestamp {
    NativeTimestamp::new(serde_json::Value::String(format_date(date)))
}

/// # Errors
/// - `InvalidInput` when the value is not RFC 3339 text
pub fn decode_timestamp(timestamp: &NativeTimestamp) -> Result<DateTime<Utc>> {
    match timestamp.raw() {
        serde_json::Value::String(text) => parse_date(text),
        other => Err(Error::InvalidInput(format!(
            "Not a relational timestamp: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gearshed_backend::{document, FieldValue};
    use proptest::prelude::*;

    #[test]
    fn test_nested_dates_and_bytes_roundtrip() {
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let doc = document([
            ("bought", Value::Timestamp(date)),
            ("receipt", Value::Bytes(vec![0, 1, 255])),
            (
                "services",
                Value::Array(vec![Value::Map(document([("at", Value::Timestamp(date))]))]),
            ),
        ]);

        let text = encode_document(&doc).unwrap();
        assert!(text.contains("\"$date\":\"2024-05-01T08:30:00.000000000Z\""));
        assert_eq!(decode_document(&text).unwrap(), doc);
    }

    #[test]
    fn test_maps_with_tag_keys_stay_maps() {
        let meta = |value: Value| document([("meta", Value::Map(document([("$date", value)])))]);
        let docs = [
            meta(Value::from("hello")),
            meta(Value::from("2024-01-01T00:00:00Z")),
            document([("raw", Value::Map(document([("$binary", 1), ("note", 2)])))]),
            document([("wrapped", Value::Map(document([("$map", "x")])))]),
            document([("price", Value::Map(document([("$usd", 12)])))]),
        ];
        for doc in docs {
            let text = encode_document(&doc).unwrap();
            assert_eq!(decode_document(&text).unwrap(), doc, "{}", text);
        }

        let text = encode_document(&meta(Value::from("hello"))).unwrap();
        assert!(text.contains("\"$map\""));
        let plain = encode_document(&document([("price", Value::Map(document([("$usd", 12)])))]));
        assert!(!plain.unwrap().contains("\"$map\""));
    }

    #[test]
    fn test_dates_sort_as_text() {
        let earlier = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(format_date(earlier) < format_date(later));
    }

    #[test]
    fn test_rejects_transforms_and_nan() {
        assert!(encode_value(&FieldValue::server_timestamp()).is_err());
        assert!(encode_value(&Value::Double(f64::NAN)).is_err());
        assert!(decode_document("[1, 2]").is_err());
    }

    proptest! {
        #[test]
        fn prop_timestamp_roundtrip(seconds in 0i64..253_402_300_799, nanos in 0u32..1_000_000_000) {
            let date = Utc.timestamp_opt(seconds, nanos).single().unwrap();
            prop_assert_eq!(decode_timestamp(&encode_timestamp(date)).unwrap(), date);
            let doc = document([("at", Value::Timestamp(date))]);
            prop_assert_eq!(decode_document(&encode_document(&doc).unwrap()).unwrap(), doc);
        }
    }
}
