//! Catalogue value types.
//!
//! A product property is one of nine data types. [`Value`] is the tagged
//! union used throughout the property container, the expression language and
//! the database backends; [`DataType`] is the corresponding type tag used in
//! schema definitions.

use crate::error::{Error, Result};
use crate::geometry::Geometry;
use std::cmp::Ordering;
use std::fmt;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::PrimitiveDateTime;
use uuid::Uuid;

/// Type tag for a catalogue value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Boolean,
    Integer,
    Long,
    Real,
    Text,
    Timestamp,
    Uuid,
    Geometry,
    Json,
}

impl DataType {
    /// Lowercase type name as used in schema definitions and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::Integer => "integer",
            DataType::Long => "long",
            DataType::Real => "real",
            DataType::Text => "text",
            DataType::Timestamp => "timestamp",
            DataType::Uuid => "uuid",
            DataType::Geometry => "geometry",
            DataType::Json => "json",
        }
    }

    /// Whether values of `other` are accepted where this type is expected.
    ///
    /// The only widening allowed is integer to long.
    pub fn accepts(&self, other: DataType) -> bool {
        *self == other || (*self == DataType::Long && other == DataType::Integer)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "boolean" => Ok(DataType::Boolean),
            "integer" => Ok(DataType::Integer),
            "long" => Ok(DataType::Long),
            "real" => Ok(DataType::Real),
            "text" => Ok(DataType::Text),
            "timestamp" => Ok(DataType::Timestamp),
            "uuid" => Ok(DataType::Uuid),
            "geometry" => Ok(DataType::Geometry),
            "json" => Ok(DataType::Json),
            other => Err(Error::Schema(format!("unknown data type: \"{other}\""))),
        }
    }
}

/// A typed catalogue value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Real(f64),
    Text(String),
    Timestamp(PrimitiveDateTime),
    Uuid(Uuid),
    Geometry(Geometry),
    Json(serde_json::Value),
}

const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year]-[month]-[day]");
const DATETIME_FORMAT: &[FormatItem<'_>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const DATETIME_SUBSECOND_FORMAT: &[FormatItem<'_>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:1+]"
);
const DATETIME_MICROS_FORMAT: &[FormatItem<'_>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]"
);

/// Parse a timestamp literal.
///
/// Accepted forms are `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` and the same with
/// a fractional second part of up to six digits. The all-zeros and all-nines
/// sentinel forms denote the minimum and maximum representable timestamps.
pub fn parse_timestamp(text: &str) -> Result<PrimitiveDateTime> {
    if is_timestamp_sentinel(text, '0') {
        return Ok(PrimitiveDateTime::MIN);
    }
    if is_timestamp_sentinel(text, '9') {
        return Ok(PrimitiveDateTime::MAX);
    }

    if let Ok(date) = time::Date::parse(text, DATE_FORMAT) {
        return Ok(date.midnight());
    }
    if let Ok(timestamp) = PrimitiveDateTime::parse(text, DATETIME_FORMAT) {
        return Ok(timestamp);
    }
    if let Ok(timestamp) = PrimitiveDateTime::parse(text, DATETIME_SUBSECOND_FORMAT) {
        return Ok(timestamp);
    }

    Err(Error::Expression(format!("invalid timestamp: \"{text}\"")))
}

fn is_timestamp_sentinel(text: &str, digit: char) -> bool {
    // "0000-00-00", optionally "T00:00:00" and up to six fractional digits
    // (and the same with nines for the maximum form)
    let date: String = format!("{d}{d}{d}{d}-{d}{d}-{d}{d}", d = digit);
    let Some(rest) = text.strip_prefix(&date) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    let time_part: String = format!("T{d}{d}:{d}{d}:{d}{d}", d = digit);
    let Some(rest) = rest.strip_prefix(&time_part) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    let Some(fraction) = rest.strip_prefix('.') else {
        return false;
    };
    fraction.len() <= 6 && fraction.chars().all(|c| c == digit)
}

/// Format a timestamp in the canonical literal form with microseconds.
pub fn format_timestamp(timestamp: &PrimitiveDateTime) -> String {
    timestamp
        .format(DATETIME_MICROS_FORMAT)
        .expect("timestamp formatting cannot fail")
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Integer(_) => DataType::Integer,
            Value::Long(_) => DataType::Long,
            Value::Real(_) => DataType::Real,
            Value::Text(_) => DataType::Text,
            Value::Timestamp(_) => DataType::Timestamp,
            Value::Uuid(_) => DataType::Uuid,
            Value::Geometry(_) => DataType::Geometry,
            Value::Json(_) => DataType::Json,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    /// Integer value widened to long, if numeric-integral.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(i64::from(*value)),
            Value::Long(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<PrimitiveDateTime> {
        match self {
            Value::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(value) => Some(*value),
            _ => None,
        }
    }

    /// Ordering between two values of comparable types.
    ///
    /// Geometry and JSON values have no order; mixed integer/long/real
    /// comparisons follow numeric value.
    pub fn partial_cmp_value(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.partial_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.partial_cmp(b),
            (Value::Uuid(a), Value::Uuid(b)) => a.partial_cmp(b),
            (Value::Real(a), Value::Real(b)) => a.partial_cmp(b),
            (a, b) => match (a.as_long(), b.as_long()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => match (numeric(a), numeric(b)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            },
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(v) => Some(f64::from(*v)),
        Value::Long(v) => Some(*v as f64),
        Value::Real(v) => Some(*v),
        _ => None,
    }
}

/// Escape a text value for inclusion in an expression literal.
pub fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    for c in text.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            other => escaped.push(other),
        }
    }
    escaped
}

impl fmt::Display for Value {
    /// The expression-literal rendering of the value.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(value) => write!(f, "{value}"),
            Value::Integer(value) => write!(f, "{value}"),
            Value::Long(value) => write!(f, "{value}"),
            Value::Real(value) => {
                if value.fract() == 0.0 && value.is_finite() {
                    write!(f, "{value:.1}")
                } else {
                    write!(f, "{value}")
                }
            }
            Value::Text(value) => write!(f, "\"{}\"", escape_text(value)),
            Value::Timestamp(value) => f.write_str(&format_timestamp(value)),
            Value::Uuid(value) => write!(f, "{value}"),
            Value::Geometry(value) => write!(f, "{value}"),
            Value::Json(value) => write!(f, "{value}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_parsing_forms() {
        let date = parse_timestamp("2024-01-15").unwrap();
        assert_eq!(format_timestamp(&date), "2024-01-15T00:00:00.000000");

        let full = parse_timestamp("2024-01-15T12:30:45").unwrap();
        assert_eq!(format_timestamp(&full), "2024-01-15T12:30:45.000000");

        let micros = parse_timestamp("2024-01-15T12:30:45.000123").unwrap();
        assert_eq!(format_timestamp(&micros), "2024-01-15T12:30:45.000123");

        assert!(parse_timestamp("2024-13-01").is_err());
        assert!(parse_timestamp("not a date").is_err());
    }

    #[test]
    fn timestamp_sentinels() {
        assert_eq!(parse_timestamp("0000-00-00").unwrap(), PrimitiveDateTime::MIN);
        assert_eq!(
            parse_timestamp("0000-00-00T00:00:00").unwrap(),
            PrimitiveDateTime::MIN
        );
        assert_eq!(
            parse_timestamp("9999-99-99T99:99:99.999999").unwrap(),
            PrimitiveDateTime::MAX
        );
        assert!(parse_timestamp("0000-00-01").is_err());
    }

    #[test]
    fn integer_widens_to_long() {
        assert!(DataType::Long.accepts(DataType::Integer));
        assert!(!DataType::Integer.accepts(DataType::Long));
        assert_eq!(
            Value::Integer(5).partial_cmp_value(&Value::Long(5)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn mixed_numeric_comparison() {
        assert_eq!(
            Value::Real(2.5).partial_cmp_value(&Value::Integer(2)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            Value::Text("a".into()).partial_cmp_value(&Value::Integer(2)),
            None
        );
    }

    #[test]
    fn text_literal_escaping() {
        let value = Value::Text("a\"b\\c\nd".into());
        assert_eq!(value.to_string(), "\"a\\\"b\\\\c\\nd\"");
    }
}
