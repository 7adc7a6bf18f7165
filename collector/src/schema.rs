//! Dataset schemas, rows and scalar values
//!
//! Every dataset (tag) has a declared, ordered column list. Rows are flat
//! column-name → [`Value`] records that the buffer validates against that
//! list before accepting them, so every sink sees one fixed shape per tag
//! regardless of what the vendor API returned.
//!
//! ```
//! use posture_collector::schema::{ColumnType, Row, Schema};
//!
//! let schema = Schema::new("Okta.Users")
//!     .column("id", ColumnType::Text)
//!     .column("active", ColumnType::Boolean);
//! assert_eq!(schema.tag(), "okta_users");
//!
//! let row = Row::new().with("id", "00u1").with("active", true);
//! assert_eq!(row.len(), 2);
//! ```

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Column stamped with the tenancy on every stored row
pub const TENANCY_COLUMN: &str = "tenancy";
/// Column stamped with the run-wide upload timestamp on every stored row
pub const UPLOAD_TIMESTAMP_COLUMN: &str = "upload_timestamp";

/// Normalize a dataset identifier: lowercase, `.` and `-` become `_`
pub fn normalize_tag(tag: &str) -> String {
    tag.trim()
        .chars()
        .map(|c| match c {
            '.' | '-' | ' ' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// Scalar column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    /// UTC timestamp, microsecond precision
    Timestamp,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

/// Declared, ordered column list for one dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    tag: String,
    columns: Vec<Column>,
}

impl Schema {
    /// Start a schema for a dataset tag (normalized)
    pub fn new(tag: &str) -> Self {
        Self {
            tag: normalize_tag(tag),
            columns: Vec::new(),
        }
    }

    /// Append a column
    pub fn column(mut self, name: impl Into<String>, kind: ColumnType) -> Self {
        self.columns.push(Column {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Columns as declared by the plugin
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns.iter().find(|c| c.name == name).map(|c| c.kind)
    }

    /// Declared columns followed by the two stamped columns
    ///
    /// This is the shape every sink writes.
    pub fn stamped(&self) -> Schema {
        let mut stamped = self.clone();
        stamped.columns.push(Column {
            name: TENANCY_COLUMN.to_string(),
            kind: ColumnType::Text,
        });
        stamped.columns.push(Column {
            name: UPLOAD_TIMESTAMP_COLUMN.to_string(),
            kind: ColumnType::Timestamp,
        });
        stamped
    }

    /// All-null sentinel row with exactly the declared key set
    pub fn sentinel(&self) -> Row {
        let mut row = Row::new();
        for column in &self.columns {
            row.set(column.name.clone(), Value::Null);
        }
        row
    }
}

/// Scalar value stored in a row
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Type name used in validation errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value may live in a column of `kind`
    ///
    /// Null fits everywhere. Integers are accepted in float columns.
    pub fn fits(&self, kind: ColumnType) -> bool {
        matches!(
            (self, kind),
            (Value::Null, _)
                | (Value::Bool(_), ColumnType::Boolean)
                | (Value::Int(_), ColumnType::Integer)
                | (Value::Int(_), ColumnType::Float)
                | (Value::Float(_), ColumnType::Float)
                | (Value::Text(_), ColumnType::Text)
                | (Value::Timestamp(_), ColumnType::Timestamp)
        )
    }

    /// Coerce into the representation `kind` expects (Int → Float)
    pub fn coerce(self, kind: ColumnType) -> Value {
        match (self, kind) {
            (Value::Int(i), ColumnType::Float) => Value::Float(i as f64),
            (other, _) => other,
        }
    }

    /// Parse a vendor timestamp string, returning `Null` when it is empty or
    /// not understood
    pub fn timestamp(raw: Option<&str>) -> Value {
        raw.and_then(parse_timestamp)
            .map(Value::Timestamp)
            .unwrap_or(Value::Null)
    }
}

/// Parse the timestamp shapes vendor APIs return
///
/// Accepts RFC 3339 (`2024-01-02T03:04:05.000Z`, offsets), naive
/// `YYYY-MM-DDTHH:MM:SS[.fff]` (read as UTC) and bare dates.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let naive = raw.trim_end_matches('Z');
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(ts.and_utc());
        }
    }
    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Timestamp(ts) => {
                serializer.serialize_str(&ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
            }
        }
    }
}

/// A flat record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: BTreeMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Value for a column, `Null` when absent
    pub fn value(&self, column: &str) -> &Value {
        self.values.get(column).unwrap_or(&Value::Null)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn into_values(self) -> BTreeMap<String, Value> {
        self.values
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (k, v) in &self.values {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalize_tag() {
        assert_eq!(normalize_tag("Okta.Users"), "okta_users");
        assert_eq!(normalize_tag("crowdstrike-hosts"), "crowdstrike_hosts");
        assert_eq!(normalize_tag("  plain "), "plain");
    }

    #[test]
    fn test_stamped_appends_reserved_columns() {
        let schema = Schema::new("t").column("id", ColumnType::Text);
        let stamped = schema.stamped();
        let names: Vec<&str> = stamped.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", TENANCY_COLUMN, UPLOAD_TIMESTAMP_COLUMN]);
        assert_eq!(
            stamped.column_type(UPLOAD_TIMESTAMP_COLUMN),
            Some(ColumnType::Timestamp)
        );
    }

    #[test]
    fn test_sentinel_has_declared_keys_all_null() {
        let schema = Schema::new("t")
            .column("a", ColumnType::Integer)
            .column("b", ColumnType::Timestamp);
        let sentinel = schema.sentinel();
        let keys: Vec<&str> = sentinel.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(sentinel.value("a").is_null());
        assert!(sentinel.value("b").is_null());
    }

    #[test]
    fn test_value_fits() {
        assert!(Value::Null.fits(ColumnType::Timestamp));
        assert!(Value::Int(1).fits(ColumnType::Float));
        assert!(!Value::Float(1.0).fits(ColumnType::Integer));
        assert!(!Value::Text("x".into()).fits(ColumnType::Boolean));
    }

    #[test]
    fn test_option_into_value() {
        let none: Option<String> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some(3_i64)), Value::Int(3));
    }

    #[test]
    fn test_parse_timestamp_shapes() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-05-01T12:30:00.000Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T12:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T12:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01T14:30:00+02:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-05-01"),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_row_serializes_nulls_and_timestamps() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let row = Row::new().with("id", Value::Null).with("seen", ts);
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["id"], serde_json::Value::Null);
        assert_eq!(json["seen"], "2024-01-02T03:04:05.000000Z");
    }
}
