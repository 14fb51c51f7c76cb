//! Query translation to SQL over the stored JSON documents.
//!
//! Fields are read with `json_extract`, array membership goes through
//! `json_each`, and every operand is a bound parameter. Values of different
//! types sort by type first: null, booleans, numbers, dates, strings, bytes,
//! arrays, maps. An `orderBy` only matches documents that have the field.

use rusqlite::types::Value as SqlValue;
use std::fmt::Write as _;

use gearshed_backend::value::field_path;
use gearshed_backend::{Bound, Direction, Filter, FilterOp, QuerySpec, Value};
use gearshed_common::{Error, Result};

use crate::codec::{encode_value, format_date, BINARY_TAG, DATE_TAG};

use super::schema::{quote, Location};

/// SQL text and its parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// A field of the `data` column as JSON paths.
struct FieldRef {
    /// `$."a"."b"`
    path: String,
    /// `$."a"."b"."$date"`
    date_path: String,
    /// `$."a"."b"."$binary"`
    binary_path: String,
}

impl FieldRef {
    /// # Errors
    /// - `InvalidInput` for an invalid dotted path or a segment with `"`
    fn parse(field: &str) -> Result<Self> {
        let mut path = String::from("$");
        for segment in field_path(field)? {
            if segment.contains('"') || segment.contains('\'') || segment.contains('\\') {
                return Err(Error::InvalidInput(format!(
                    "Field name '{}' cannot contain quotes or backslashes",
                    field
                )));
            }
            let _ = write!(path, ".\"{}\"", segment);
        }
        Ok(Self {
            date_path: format!("{}.\"{}\"", path, DATE_TAG),
            binary_path: format!("{}.\"{}\"", path, BINARY_TAG),
            path,
        })
    }

    fn json_type(&self) -> String {
        format!("json_type(data, '{}')", self.path)
    }

    fn extract(&self) -> String {
        format!("json_extract(data, '{}')", self.path)
    }

    fn extract_date(&self) -> String {
        format!("json_extract(data, '{}')", self.date_path)
    }

    /// Present and not null.
    fn is_set(&self) -> String {
        format!("({t} IS NOT NULL AND {t} != 'null')", t = self.json_type())
    }

    /// Cross-type sort rank of the stored value.
    fn rank(&self) -> String {
        format!(
            "(CASE {t} WHEN 'null' THEN 0 WHEN 'true' THEN 1 WHEN 'false' THEN 1 \
             WHEN 'integer' THEN 2 WHEN 'real' THEN 2 WHEN 'text' THEN 4 WHEN 'array' THEN 6 \
             WHEN 'object' THEN (CASE WHEN json_type(data, '{d}') = 'text' THEN 3 \
             WHEN json_type(data, '{b}') = 'text' THEN 5 ELSE 7 END) END)",
            t = self.json_type(),
            d = self.date_path,
            b = self.binary_path,
        )
    }

    /// Sort key within a rank: dates as text, structures as JSON text.
    fn sort_key(&self) -> String {
        format!("COALESCE({}, {})", self.extract_date(), self.extract())
    }
}

/// How a value is compared in SQL.
enum Operand {
    Null,
    Bool(bool),
    Number(SqlValue),
    Text(String),
    Date(String),
    /// Bytes, arrays and maps, compared as canonical JSON text.
    Json(String),
}

impl Operand {
    fn of(value: &Value) -> Result<Self> {
        Ok(match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Integer(n) => Self::Number(SqlValue::Integer(*n)),
            Value::Double(n) => Self::Number(SqlValue::Real(*n)),
            Value::String(s) => Self::Text(s.clone()),
            Value::Timestamp(date) => Self::Date(format_date(*date)),
            Value::Bytes(_) | Value::Array(_) | Value::Map(_) => {
                Self::Json(encode_value(value)?.to_string())
            }
            Value::Field(field) => {
                return Err(Error::InvalidInput(format!(
                    "{}() cannot be used as a query operand",
                    field.kind()
                )))
            }
        })
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Number(_) => 2,
            Self::Date(_) => 3,
            Self::Text(_) => 4,
            Self::Json(text) if text.starts_with("{\"$binary\"") => 5,
            Self::Json(text) if text.starts_with('[') => 6,
            Self::Json(_) => 7,
        }
    }

    /// The bound parameter and its placeholder; `None` for null.
    fn param(&self) -> Option<(&'static str, SqlValue)> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(("?", SqlValue::Integer(i64::from(*b)))),
            Self::Number(n) => Some(("?", n.clone())),
            Self::Text(s) | Self::Date(s) => Some(("?", SqlValue::Text(s.clone()))),
            Self::Json(text) => Some(("json(?)", SqlValue::Text(text.clone()))),
        }
    }
}

/// Accumulates a condition and its parameters.
#[derive(Default)]
struct Builder {
    params: Vec<SqlValue>,
}

impl Builder {
    fn bind(&mut self, placeholder: &'static str, value: SqlValue) -> &'static str {
        self.params.push(value);
        placeholder
    }

    /// Stored value at `field` equals `operand`, type included.
    fn equals(&mut self, field: &FieldRef, operand: &Operand) -> String {
        let t = field.json_type();
        match operand {
            Operand::Null => format!("{} = 'null'", t),
            Operand::Date(_) => {
                let (ph, v) = operand_param(operand);
                let ph = self.bind(ph, v);
                format!("{} = {}", field.extract_date(), ph)
            }
            _ => {
                let (ph, v) = operand_param(operand);
                let ph = self.bind(ph, v);
                format!("({} AND {} = {})", type_guard(&t, operand), field.extract(), ph)
            }
        }
    }

    /// Order comparison in the cross-type sort order; `op` is `<` or `>`.
    fn beyond(&mut self, field: &FieldRef, operand: &Operand, op: &str) -> String {
        let rank = field.rank();
        let r = operand.rank();
        match operand.param() {
            None => format!("{} {} {}", rank, op, r),
            Some((ph, v)) => {
                let ph = self.bind(ph, v);
                format!(
                    "({rank} {op} {r} OR ({rank} = {r} AND {key} {op} {ph}))",
                    rank = rank,
                    op = op,
                    r = r,
                    key = field.sort_key(),
                    ph = ph
                )
            }
        }
    }

    /// Same position in the sort order as `operand`.
    fn level(&mut self, field: &FieldRef, operand: &Operand) -> String {
        let rank = field.rank();
        match operand.param() {
            None => format!("{} = 0", rank),
            Some((ph, v)) => {
                let ph = self.bind(ph, v);
                format!(
                    "({} = {} AND {} = {})",
                    rank,
                    operand.rank(),
                    field.sort_key(),
                    ph
                )
            }
        }
    }

    fn filter(&mut self, filter: &Filter) -> Result<String> {
        let field = FieldRef::parse(&filter.field)?;
        let unsupported = |what: &str| {
            Error::Unsupported(format!(
                "relational does not support '{}' on {} values",
                filter.op, what
            ))
        };

        Ok(match filter.op {
            FilterOp::Equal => self.equals(&field, &Operand::of(&filter.value)?),
            FilterOp::NotEqual => {
                let operand = Operand::of(&filter.value)?;
                let eq = self.equals(&field, &operand);
                format!("({} AND NOT {})", field.is_set(), eq)
            }
            FilterOp::LessThan
            | FilterOp::LessThanOrEqual
            | FilterOp::GreaterThan
            | FilterOp::GreaterThanOrEqual => {
                let operand = Operand::of(&filter.value)?;
                let sql_op = match filter.op {
                    FilterOp::LessThan => "<",
                    FilterOp::LessThanOrEqual => "<=",
                    FilterOp::GreaterThan => ">",
                    _ => ">=",
                };
                match &operand {
                    Operand::Null => return Err(unsupported("null")),
                    Operand::Json(_) => return Err(unsupported(filter.value.type_name())),
                    Operand::Date(_) => {
                        let (ph, v) = operand_param(&operand);
                        let ph = self.bind(ph, v);
                        format!(
                            "(json_type(data, '{}') = 'text' AND {} {} {})",
                            field.date_path,
                            field.extract_date(),
                            sql_op,
                            ph
                        )
                    }
                    _ => {
                        let (ph, v) = operand_param(&operand);
                        let ph = self.bind(ph, v);
                        format!(
                            "({} AND {} {} {})",
                            type_guard(&field.json_type(), &operand),
                            field.extract(),
                            sql_op,
                            ph
                        )
                    }
                }
            }
            FilterOp::In => self.any_equal(&field, filter.values())?,
            FilterOp::NotIn => {
                let any = self.any_equal(&field, filter.values())?;
                format!("({} AND NOT {})", field.is_set(), any)
            }
            FilterOp::ArrayContains => self.contains(&field, std::slice::from_ref(&filter.value))?,
            FilterOp::ArrayContainsAny => self.contains(&field, filter.values())?,
        })
    }

    fn any_equal(&mut self, field: &FieldRef, values: &[Value]) -> Result<String> {
        let parts = values
            .iter()
            .map(|v| Ok(self.equals(field, &Operand::of(v)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("({})", parts.join(" OR ")))
    }

    /// The array at `field` has an element equal to one of `values`.
    fn contains(&mut self, field: &FieldRef, values: &[Value]) -> Result<String> {
        let parts = values
            .iter()
            .map(|v| {
                let operand = Operand::of(v)?;
                Ok(match operand.param() {
                    None => "e.type = 'null'".to_string(),
                    Some((ph, value)) => {
                        let guard = element_guard(&operand);
                        let ph = self.bind(ph, value);
                        format!("({} AND e.value = {})", guard, ph)
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(
            "({t} = 'array' AND EXISTS (SELECT 1 FROM json_each(data, '{p}') AS e WHERE {c}))",
            t = field.json_type(),
            p = field.path,
            c = parts.join(" OR ")
        ))
    }

    /// Rows after (or at) a cursor, as a lexicographic expansion.
    fn start(&mut self, orders: &[(FieldRef, Direction)], bound: &Bound) -> Result<String> {
        let operands = bound
            .values
            .iter()
            .map(Operand::of)
            .collect::<Result<Vec<_>>>()?;
        let last_direction = orders
            .last()
            .map(|(_, d)| *d)
            .unwrap_or(Direction::Ascending);

        let mut alternatives = Vec::new();
        for i in 0..operands.len() {
            let mut terms = Vec::new();
            for (j, operand) in operands.iter().enumerate().take(i) {
                terms.push(self.level(&orders[j].0, operand));
            }
            let (field, direction) = &orders[i];
            terms.push(self.beyond(field, &operands[i], strict(*direction)));
            alternatives.push(format!("({})", terms.join(" AND ")));
        }

        if bound.document_id.is_some() || bound.inclusive {
            let mut terms = Vec::new();
            for (j, operand) in operands.iter().enumerate() {
                terms.push(self.level(&orders[j].0, operand));
            }
            if let Some(id) = &bound.document_id {
                let op = match (last_direction, bound.inclusive) {
                    (Direction::Ascending, false) => ">",
                    (Direction::Ascending, true) => ">=",
                    (Direction::Descending, false) => "<",
                    (Direction::Descending, true) => "<=",
                };
                let ph = self.bind("?", SqlValue::Text(id.clone()));
                terms.push(format!("id {} {}", op, ph));
            }
            alternatives.push(format!("({})", terms.join(" AND ")));
        }

        Ok(format!("({})", alternatives.join(" OR ")))
    }
}

fn strict(direction: Direction) -> &'static str {
    match direction {
        Direction::Ascending => ">",
        Direction::Descending => "<",
    }
}

fn operand_param(operand: &Operand) -> (&'static str, SqlValue) {
    operand.param().unwrap_or(("?", SqlValue::Null))
}

/// `json_type` values matching the operand's type class.
fn type_guard(json_type: &str, operand: &Operand) -> String {
    match operand {
        Operand::Null => format!("{} = 'null'", json_type),
        Operand::Bool(_) => format!("{} IN ('true', 'false')", json_type),
        Operand::Number(_) => format!("{} IN ('integer', 'real')", json_type),
        Operand::Text(_) => format!("{} = 'text'", json_type),
        Operand::Date(_) | Operand::Json(_) => format!("{} IN ('object', 'array')", json_type),
    }
}

fn element_guard(operand: &Operand) -> &'static str {
    match operand {
        Operand::Null => "e.type = 'null'",
        Operand::Bool(_) => "e.type IN ('true', 'false')",
        Operand::Number(_) => "e.type IN ('integer', 'real')",
        Operand::Text(_) => "e.type = 'text'",
        Operand::Date(_) | Operand::Json(_) => "e.type IN ('object', 'array')",
    }
}

/// `SELECT id, data, revision` for a query against `location`.
///
/// # Errors
/// - `InvalidInput` for an invalid field path
/// - `Unsupported` for a range filter on null, bytes, arrays or maps
pub fn select(location: &Location, spec: &QuerySpec) -> Result<Statement> {
    let mut builder = Builder::default();
    let mut conditions = vec!["parent = ?".to_string()];
    builder.params.push(SqlValue::Text(location.parent.clone()));

    for filter in &spec.filters {
        conditions.push(builder.filter(filter)?);
    }

    let orders = spec
        .orders
        .iter()
        .map(|o| Ok((FieldRef::parse(&o.field)?, o.direction)))
        .collect::<Result<Vec<_>>>()?;
    for (field, _) in &orders {
        conditions.push(format!("{} IS NOT NULL", field.json_type()));
    }

    if let Some(bound) = &spec.start {
        conditions.push(builder.start(&orders, bound)?);
    }

    let mut sql = format!(
        "SELECT id, data, revision FROM {} WHERE {}",
        quote(&location.table),
        conditions.join(" AND ")
    );

    let mut keys = Vec::new();
    for (field, direction) in &orders {
        let dir = sql_direction(*direction);
        keys.push(format!("{} {}", field.rank(), dir));
        keys.push(format!("{} {}", field.sort_key(), dir));
    }
    let id_direction = orders
        .last()
        .map(|(_, d)| *d)
        .unwrap_or(Direction::Ascending);
    keys.push(format!("id {}", sql_direction(id_direction)));
    let _ = write!(sql, " ORDER BY {}", keys.join(", "));

    if let Some(limit) = spec.limit {
        sql.push_str(" LIMIT ?");
        builder
            .params
            .push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
    }

    Ok(Statement {
        sql,
        params: builder.params,
    })
}

fn sql_direction(direction: Direction) -> &'static str {
    match direction {
        Direction::Ascending => "ASC",
        Direction::Descending => "DESC",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gearshed_backend::QueryConstraint;

    fn location() -> Location {
        Location {
            table: "bikes".to_string(),
            parent: String::new(),
            foreign_key: None,
        }
    }

    fn statement(constraints: &[QueryConstraint]) -> Result<Statement> {
        select(&location(), &QuerySpec::from_constraints(constraints)?)
    }

    #[test]
    fn test_plain_select_orders_by_id() {
        let stmt = statement(&[]).unwrap();
        assert!(stmt.sql.starts_with("SELECT id, data, revision FROM \"bikes\" WHERE parent = ?"));
        assert!(stmt.sql.ends_with("ORDER BY id ASC"));
        assert_eq!(stmt.params, vec![SqlValue::Text(String::new())]);
    }

    #[test]
    fn test_filters_bind_parameters() {
        let stmt = statement(&[
            QueryConstraint::where_("status", FilterOp::Equal, "active"),
            QueryConstraint::where_("km", FilterOp::GreaterThan, 100),
            QueryConstraint::limit(5),
        ])
        .unwrap();
        assert!(stmt.sql.contains("json_extract(data, '$.\"status\"') = ?"));
        assert!(stmt.sql.contains("json_extract(data, '$.\"km\"') > ?"));
        assert!(stmt.sql.ends_with("LIMIT ?"));
        assert_eq!(
            stmt.params,
            vec![
                SqlValue::Text(String::new()),
                SqlValue::Text("active".to_string()),
                SqlValue::Integer(100),
                SqlValue::Integer(5),
            ]
        );
    }

    #[test]
    fn test_array_membership_uses_json_each() {
        let stmt = statement(&[QueryConstraint::where_(
            "tags",
            FilterOp::ArrayContains,
            "gravel",
        )])
        .unwrap();
        assert!(stmt.sql.contains("json_each(data, '$.\"tags\"')"));
    }

    #[test]
    fn test_range_on_structures_is_unsupported() {
        let err = statement(&[QueryConstraint::where_(
            "specs",
            FilterOp::LessThan,
            Value::Array(vec![Value::from(1)]),
        )])
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_rejects_quotes_in_field_names() {
        let err = statement(&[QueryConstraint::where_("it's", FilterOp::Equal, 1)]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
