//! Schema-driven field coercion at the store boundary.
//!
//! Callers above the storage layer often hold book attributes as loose
//! strings (form input, import rows). Instead of switching on runtime types,
//! each column declares a [`ColumnType`] and [`coerce`] converts the raw text
//! into a typed [`FieldValue`] that binds directly to a statement parameter.

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value};

/// Storage class of a column as seen by the coercion step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Free text.
    Text,
    /// 64-bit signed integer.
    Integer,
    /// Floating point.
    Real,
    /// Stored as integer 0/1.
    Boolean,
    /// `YYYY`, `YYYY-MM` or `YYYY-MM-DD`, stored as text.
    Date,
    /// `YYYY-MM-DD HH:MM:SS` (UTC), stored as text.
    DateTime,
}

/// A column definition used for coercion.
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    /// Column name.
    pub name: &'static str,
    /// Declared storage class.
    pub column_type: ColumnType,
    /// Whether an empty input may be stored as NULL.
    pub nullable: bool,
}

impl ColumnDef {
    /// Creates a column definition.
    #[must_use]
    pub const fn new(name: &'static str, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name,
            column_type,
            nullable,
        }
    }
}

/// A typed value ready for binding.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// SQL NULL.
    Null,
    /// Text value.
    Text(String),
    /// Integer value (booleans are stored as 0/1).
    Integer(i64),
    /// Real value.
    Real(f64),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl FieldValue {
    /// Returns the value as text, treating NULL as empty.
    #[must_use]
    pub fn into_text(self) -> String {
        match self {
            Self::Null | Self::Blob(_) => String::new(),
            Self::Text(s) => s,
            Self::Integer(i) => i.to_string(),
            Self::Real(r) => r.to_string(),
        }
    }

    /// Returns the value as an integer if it has one.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Real(r) => Some(*r as i64),
            _ => None,
        }
    }

    /// Returns the value as a float if it has one.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Real(r) => Some(*r),
            _ => None,
        }
    }

    /// Returns true for a non-zero integer.
    #[must_use]
    pub const fn as_bool(&self) -> bool {
        matches!(self, Self::Integer(i) if *i != 0)
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Text(s) => ToSqlOutput::from(s.as_str()),
            Self::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            Self::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            Self::Blob(b) => ToSqlOutput::from(b.as_slice()),
        })
    }
}

/// Coerces raw text into the storage class declared by `column`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the text cannot represent a value of
/// the column's type, or if an empty value is given for a non-nullable
/// numeric column.
pub fn coerce(column: &ColumnDef, raw: &str) -> Result<FieldValue> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return match column.column_type {
            ColumnType::Text | ColumnType::Date => Ok(FieldValue::Text(String::new())),
            _ if column.nullable => Ok(FieldValue::Null),
            ColumnType::Boolean => Ok(FieldValue::Integer(0)),
            _ => Err(invalid(column, raw, "value is required")),
        };
    }

    match column.column_type {
        ColumnType::Text => Ok(FieldValue::Text(raw.to_string())),
        ColumnType::Integer => trimmed
            .parse::<i64>()
            .map(FieldValue::Integer)
            .map_err(|e| invalid(column, raw, &e.to_string())),
        ColumnType::Real => trimmed
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(FieldValue::Real)
            .ok_or_else(|| invalid(column, raw, "not a finite number")),
        ColumnType::Boolean => parse_bool(trimmed)
            .map(|b| FieldValue::Integer(i64::from(b)))
            .ok_or_else(|| invalid(column, raw, "not a boolean")),
        ColumnType::Date => parse_partial_date(trimmed)
            .map(FieldValue::Text)
            .ok_or_else(|| invalid(column, raw, "expected YYYY, YYYY-MM or YYYY-MM-DD")),
        ColumnType::DateTime => parse_datetime(trimmed)
            .map(FieldValue::Text)
            .ok_or_else(|| invalid(column, raw, "expected YYYY-MM-DD HH:MM:SS")),
    }
}

fn invalid(column: &ColumnDef, raw: &str, reason: &str) -> Error {
    Error::InvalidInput(format!(
        "column '{}' cannot hold '{raw}': {reason}",
        column.name
    ))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" => Some(true),
        "0" | "false" | "f" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn parse_partial_date(s: &str) -> Option<String> {
    let parts: Vec<&str> = s.split('-').collect();
    let all_digits = parts
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !all_digits || parts[0].len() != 4 {
        return None;
    }
    match parts.len() {
        1 => Some(s.to_string()),
        2 => {
            let month: u32 = parts[1].parse().ok()?;
            (1..=12)
                .contains(&month)
                .then(|| format!("{}-{month:02}", parts[0]))
        },
        3 => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .map(|d| d.format("%Y-%m-%d").to_string()),
        _ => None,
    }
}

fn parse_datetime(s: &str) -> Option<String> {
    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, FORMAT) {
        return Some(dt.format(FORMAT).to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc().format(FORMAT).to_string());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.format(FORMAT).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const PAGES: ColumnDef = ColumnDef::new("pages", ColumnType::Integer, true);
    const RATING: ColumnDef = ColumnDef::new("rating", ColumnType::Real, false);
    const READ: ColumnDef = ColumnDef::new("read", ColumnType::Boolean, false);
    const PUBLISHED: ColumnDef = ColumnDef::new("date_published", ColumnType::Date, true);
    const ADDED: ColumnDef = ColumnDef::new("date_added", ColumnType::DateTime, true);

    #[test_case("1", true ; "digit one")]
    #[test_case("t", true ; "legacy t")]
    #[test_case("Yes", true ; "yes mixed case")]
    #[test_case("0", false ; "digit zero")]
    #[test_case("f", false ; "legacy f")]
    #[test_case("false", false ; "word false")]
    fn test_coerce_boolean(raw: &str, expected: bool) {
        let value = coerce(&READ, raw).unwrap();
        assert_eq!(value.as_bool(), expected);
    }

    #[test]
    fn test_coerce_boolean_rejects_garbage() {
        assert!(matches!(
            coerce(&READ, "maybe"),
            Err(Error::InvalidInput(msg)) if msg.contains("read")
        ));
    }

    #[test]
    fn test_coerce_integer() {
        assert_eq!(coerce(&PAGES, " 412 ").unwrap(), FieldValue::Integer(412));
        assert_eq!(coerce(&PAGES, "").unwrap(), FieldValue::Null);
        assert!(coerce(&PAGES, "12.5").is_err());
    }

    #[test]
    fn test_coerce_real_requires_value_when_not_nullable() {
        assert_eq!(coerce(&RATING, "4.5").unwrap(), FieldValue::Real(4.5));
        assert!(coerce(&RATING, "").is_err());
        assert!(coerce(&RATING, "NaN").is_err());
    }

    #[test_case("1965", "1965" ; "year only")]
    #[test_case("1965-8", "1965-08" ; "year and month")]
    #[test_case("1965-08-01", "1965-08-01" ; "full date")]
    fn test_coerce_partial_dates(raw: &str, expected: &str) {
        assert_eq!(
            coerce(&PUBLISHED, raw).unwrap(),
            FieldValue::Text(expected.to_string())
        );
    }

    #[test]
    fn test_coerce_date_rejects_invalid_day() {
        assert!(coerce(&PUBLISHED, "1965-02-30").is_err());
        assert!(coerce(&PUBLISHED, "65-02-01").is_err());
    }

    #[test]
    fn test_coerce_datetime_normalizes_rfc3339() {
        let value = coerce(&ADDED, "2020-01-02T03:04:05+00:00").unwrap();
        assert_eq!(value, FieldValue::Text("2020-01-02 03:04:05".to_string()));
    }

    #[test]
    fn test_field_value_binds() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let v: i64 = conn
            .query_row("SELECT ?1 + 1", [FieldValue::Integer(41)], |row| row.get(0))
            .unwrap();
        assert_eq!(v, 42);
        let n: Option<i64> = conn
            .query_row("SELECT ?1", [FieldValue::Null], |row| row.get(0))
            .unwrap();
        assert!(n.is_none());
    }
}
