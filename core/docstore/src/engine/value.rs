//! Native values of the document engine.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use gearshed_common::{Error, Result};

/// Fields of a stored document.
pub type NativeMap = BTreeMap<String, NativeValue>;

const NANOS_PER_SECOND: i32 = 1_000_000_000;

/// Engine timestamp: seconds since the epoch plus a nanosecond remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    /// # Errors
    /// - `nanos` outside `0..1_000_000_000`
    pub fn new(seconds: i64, nanos: i32) -> Result<Self> {
        if !(0..NANOS_PER_SECOND).contains(&nanos) {
            return Err(Error::InvalidInput(format!(
                "Timestamp nanos out of range: {}",
                nanos
            )));
        }
        Ok(Self { seconds, nanos })
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(date: DateTime<Utc>) -> Self {
        Self {
            seconds: date.timestamp(),
            nanos: date.timestamp_subsec_nanos() as i32,
        }
    }

    /// # Errors
    /// - The timestamp is outside the representable date range
    pub fn to_datetime(&self) -> Result<DateTime<Utc>> {
        Utc.timestamp_opt(self.seconds, self.nanos as u32)
            .single()
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "Timestamp out of range: {}s {}ns",
                    self.seconds, self.nanos
                ))
            })
    }
}

/// A value as the document engine stores it.
#[derive(Debug, Clone)]
pub enum NativeValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<NativeValue>),
    Map(NativeMap),
}

impl NativeValue {
    /// Rank of the value's type in the cross-type sort order.
    fn type_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Boolean(_) => 1,
            Self::Integer(_) | Self::Double(_) => 2,
            Self::Timestamp(_) => 3,
            Self::String(_) => 4,
            Self::Bytes(_) => 5,
            Self::Array(_) => 6,
            Self::Map(_) => 7,
        }
    }

    /// Whether two values belong to the same comparison class, so that a
    /// range filter between them is meaningful.
    pub fn same_type_class(&self, other: &NativeValue) -> bool {
        self.type_rank() == other.type_rank()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Integer(n) => Some(*n as f64),
            Self::Double(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[NativeValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Total order over all values: by type rank, then within the type.
    pub fn total_cmp(&self, other: &NativeValue) -> Ordering {
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }

        match (self, other) {
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (a, b) if a.type_rank() == 2 => compare_numbers(a, b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Array(a), Self::Array(b)) => {
                for (x, y) in a.iter().zip(b) {
                    let ord = x.total_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Self::Map(a), Self::Map(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b) {
                    let ord = ka.cmp(kb).then_with(|| va.total_cmp(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => Ordering::Equal,
        }
    }
}

fn compare_numbers(a: &NativeValue, b: &NativeValue) -> Ordering {
    let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
        return Ordering::Equal;
    };
    // NaN sorts before every other number.
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

/// Equality by value: `1` equals `1.0`, maps compare field by field.
impl PartialEq for NativeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Double(a), Self::Double(b)) if a.is_nan() && b.is_nan() => true,
            _ => self.total_cmp(other) == Ordering::Equal,
        }
    }
}

/// Transform applied to a field when a write commits.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Set to the commit time.
    RequestTime,
    /// Add a number to the current value.
    Increment(NativeValue),
    /// Append elements not already present.
    AppendMissing(Vec<NativeValue>),
    /// Remove every occurrence of the elements.
    RemoveAll(Vec<NativeValue>),
}

impl Transform {
    /// The field's value after the transform.
    pub fn apply(&self, current: Option<&NativeValue>, commit_time: Timestamp) -> NativeValue {
        match self {
            Self::RequestTime => NativeValue::Timestamp(commit_time),
            Self::Increment(delta) => match (current, delta) {
                (Some(NativeValue::Integer(a)), NativeValue::Integer(b)) => {
                    NativeValue::Integer(a.saturating_add(*b))
                }
                (Some(current @ (NativeValue::Integer(_) | NativeValue::Double(_))), delta) => {
                    NativeValue::Double(
                        current.as_number().unwrap_or_default() + delta.as_number().unwrap_or_default(),
                    )
                }
                (_, delta) => delta.clone(),
            },
            Self::AppendMissing(elements) => {
                let mut items = current
                    .and_then(NativeValue::as_array)
                    .map(<[NativeValue]>::to_vec)
                    .unwrap_or_default();
                for element in elements {
                    if !items.contains(element) {
                        items.push(element.clone());
                    }
                }
                NativeValue::Array(items)
            }
            Self::RemoveAll(elements) => NativeValue::Array(
                current
                    .and_then(NativeValue::as_array)
                    .unwrap_or_default()
                    .iter()
                    .filter(|item| !elements.contains(item))
                    .cloned()
                    .collect(),
            ),
        }
    }
}

/// Look up a field path inside a map.
pub fn lookup<'a>(fields: &'a NativeMap, path: &[String]) -> Option<&'a NativeValue> {
    let (first, rest) = path.split_first()?;
    let mut current = fields.get(first)?;
    for segment in rest {
        match current {
            NativeValue::Map(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Set a field path, creating or replacing intermediate maps.
pub fn assign(fields: &mut NativeMap, path: &[String], value: NativeValue) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = fields;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| NativeValue::Map(NativeMap::new()));
        if !matches!(entry, NativeValue::Map(_)) {
            *entry = NativeValue::Map(NativeMap::new());
        }
        current = match entry {
            NativeValue::Map(map) => map,
            _ => return,
        };
    }
    current.insert(last.clone(), value);
}

/// Remove a field path; missing intermediate maps are ignored.
pub fn erase(fields: &mut NativeMap, path: &[String]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = fields;
    for segment in parents {
        current = match current.get_mut(segment) {
            Some(NativeValue::Map(map)) => map,
            _ => return,
        };
    }
    current.remove(last);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_type_order() {
        let ordered = [
            NativeValue::Null,
            NativeValue::Boolean(false),
            NativeValue::Boolean(true),
            NativeValue::Integer(-1),
            NativeValue::Double(0.5),
            NativeValue::Integer(1),
            NativeValue::Timestamp(Timestamp { seconds: 0, nanos: 0 }),
            NativeValue::String("a".into()),
            NativeValue::Bytes(vec![0]),
            NativeValue::Array(vec![]),
            NativeValue::Map(NativeMap::new()),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(pair[0].total_cmp(&pair[1]), Ordering::Less, "{:?}", pair);
        }
    }

    #[test]
    fn test_numeric_equality() {
        assert_eq!(NativeValue::Integer(1), NativeValue::Double(1.0));
        assert_ne!(NativeValue::Integer(1), NativeValue::String("1".into()));
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let date = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let ts = Timestamp::from_datetime(date);
        assert_eq!(ts.nanos, 123_456_789);
        assert_eq!(ts.to_datetime().unwrap(), date);
        assert!(Timestamp::new(0, -1).is_err());
        assert!(Timestamp::new(0, NANOS_PER_SECOND).is_err());
    }

    #[test]
    fn test_transforms() {
        let now = Timestamp { seconds: 10, nanos: 0 };
        let inc = Transform::Increment(NativeValue::Integer(5));
        assert_eq!(inc.apply(None, now), NativeValue::Integer(5));
        assert_eq!(
            inc.apply(Some(&NativeValue::Integer(5)), now),
            NativeValue::Integer(10)
        );
        assert_eq!(
            inc.apply(Some(&NativeValue::Double(0.5)), now),
            NativeValue::Double(5.5)
        );

        let union = Transform::AppendMissing(vec![NativeValue::Integer(2), NativeValue::Integer(3)]);
        let current = NativeValue::Array(vec![NativeValue::Integer(1), NativeValue::Integer(2)]);
        assert_eq!(
            union.apply(Some(&current), now),
            NativeValue::Array(vec![
                NativeValue::Integer(1),
                NativeValue::Integer(2),
                NativeValue::Integer(3)
            ])
        );

        let remove = Transform::RemoveAll(vec![NativeValue::Integer(1)]);
        assert_eq!(
            remove.apply(Some(&current), now),
            NativeValue::Array(vec![NativeValue::Integer(2)])
        );
        assert_eq!(
            Transform::RequestTime.apply(None, now),
            NativeValue::Timestamp(now)
        );
    }

    #[test]
    fn test_assign_and_erase() {
        let mut fields = NativeMap::new();
        let path = vec!["a".to_string(), "b".to_string()];
        assign(&mut fields, &path, NativeValue::Integer(1));
        assert_eq!(lookup(&fields, &path), Some(&NativeValue::Integer(1)));
        erase(&mut fields, &path);
        assert_eq!(lookup(&fields, &path), None);
        assert!(matches!(fields.get("a"), Some(NativeValue::Map(m)) if m.is_empty()));
    }
}
