//! Scalar values as they arrive from the portal and the warehouse, and their
//! single textual form used for merging and change detection.

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Type-erased scalar carried by raw entries and external rows.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScalarValue {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl ScalarValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<NaiveDate> for ScalarValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<NaiveDateTime> for ScalarValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<ScalarValue>> From<Option<T>> for ScalarValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// JSON has no date types; nested arrays/objects are kept as their JSON text.
impl From<serde_json::Value> for ScalarValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value as J;
        match value {
            J::Null => Self::Null,
            J::Bool(b) => Self::Boolean(b),
            J::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Text(n.to_string())),
            },
            J::String(s) => Self::Text(s),
            other => Self::Text(other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for ScalarValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from)
    }
}

impl Serialize for ScalarValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Boolean(b) => serializer.serialize_bool(*b),
            Self::Integer(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            other => match normalize(other) {
                Some(text) => serializer.serialize_str(&text),
                None => serializer.serialize_none(),
            },
        }
    }
}

/// Collapse any scalar to its canonical text. `Null` stays `None`.
pub fn normalize(value: &ScalarValue) -> Option<String> {
    match value {
        ScalarValue::Null => None,
        ScalarValue::Text(s) => Some(s.clone()),
        ScalarValue::Integer(i) => Some(i.to_string()),
        ScalarValue::Float(f) => Some(format_float(*f)),
        ScalarValue::Boolean(b) => Some(bool_text(*b).to_string()),
        ScalarValue::Date(d) => Some(d.format(DATE_FORMAT).to_string()),
        ScalarValue::Timestamp(ts) => Some(format_timestamp(*ts)),
    }
}

pub fn bool_text(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        // integral: no trailing ".0"
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn format_timestamp(ts: NaiveDateTime) -> String {
    if ts.nanosecond() == 0 {
        ts.format(TIMESTAMP_FORMAT).to_string()
    } else {
        ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()
    }
}

/// Storage type of a period-table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Boolean,
    Text,
}

impl ColumnKind {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Boolean => "BOOLEAN",
            Self::Text => "TEXT",
        }
    }

    pub fn from_declared_type(declared: &str) -> Self {
        if declared.eq_ignore_ascii_case("BOOLEAN") {
            Self::Boolean
        } else {
            Self::Text
        }
    }
}

/// One persisted cell, either side of the diff.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    #[default]
    Null,
    Flag(bool),
    Text(String),
}

impl Cell {
    pub fn text(value: Option<String>) -> Self {
        value.map(Self::Text).unwrap_or(Self::Null)
    }

    /// Textual form used by the change detector. Boolean columns compare by
    /// truth value so stored `1`/`0` and incoming flags agree.
    pub fn comparable(&self, kind: ColumnKind) -> Option<String> {
        match (kind, self) {
            (_, Self::Null) => None,
            (ColumnKind::Boolean, cell) => cell.as_flag().map(|b| bool_text(b).to_string()),
            (ColumnKind::Text, Self::Flag(b)) => Some(bool_text(*b).to_string()),
            (ColumnKind::Text, Self::Text(s)) => Some(s.clone()),
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Null => None,
            Self::Flag(b) => Some(*b),
            Self::Text(s) => match s.trim() {
                "1" => Some(true),
                "0" => Some(false),
                t if t.eq_ignore_ascii_case("true") => Some(true),
                t if t.eq_ignore_ascii_case("false") => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}
