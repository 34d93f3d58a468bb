//! Log record types and utilities

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Log severity levels, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug: diagnostic detail
    Debug,
    /// Info: normal operation
    Info,
    /// Warn: something unexpected but recoverable
    Warn,
    /// Error: an operation failed
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => f.pad("DEBUG"),
            LogLevel::Info => f.pad("INFO"),
            LogLevel::Warn => f.pad("WARN"),
            LogLevel::Error => f.pad("ERROR"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// A scalar field value.
///
/// Decoding from JSON is lossy for integers: any value that fits an `i64`
/// comes back as [`FieldValue::Int`], whatever variant was encoded. Compare
/// decoded integers through [`FieldValue::as_i64`] / [`FieldValue::as_u64`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Boolean value
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    Uint(u64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    String(String),
}

impl FieldValue {
    /// Integer value as `i64`, if it is an integer that fits
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Uint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Integer value as `u64`, if it is a non-negative integer
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Int(v) => u64::try_from(*v).ok(),
            FieldValue::Uint(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Uint(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v.into())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Uint(v.into())
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Uint(v)
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        FieldValue::Uint(v as u64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

/// Durations are recorded as integer nanoseconds.
impl From<Duration> for FieldValue {
    fn from(v: Duration) -> Self {
        FieldValue::Uint(u64::try_from(v.as_nanos()).unwrap_or(u64::MAX))
    }
}

/// Ordered key/value pairs attached to a record.
///
/// Keys are kept in insertion order and duplicates are preserved; the JSON
/// encoding repeats a duplicated key rather than collapsing it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFields(Vec<(String, FieldValue)>);

impl LogFields {
    /// Create an empty field list
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a field, builder style
    pub fn with<K: Into<String>, V: Into<FieldValue>>(mut self, key: K, value: V) -> Self {
        self.push(key, value);
        self
    }

    /// Append a field
    pub fn push<K: Into<String>, V: Into<FieldValue>>(&mut self, key: K, value: V) {
        self.0.push((key.into(), value.into()));
    }

    /// First value recorded under `key`
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Iterate fields in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields, duplicates included
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no fields are present
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for LogFields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl Serialize for LogFields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for LogFields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldsVisitor;

        impl<'de> Visitor<'de> for FieldsVisitor {
            type Value = LogFields;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of scalar fields")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut fields = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, FieldValue>()? {
                    fields.push((key, value));
                }
                Ok(LogFields(fields))
            }
        }

        deserializer.deserialize_map(FieldsVisitor)
    }
}

/// A structured log record. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp when the record was created
    pub timestamp: DateTime<Utc>,

    /// Severity level
    pub level: LogLevel,

    /// Primary log message
    pub message: String,

    /// Additional structured fields
    #[serde(default)]
    pub fields: LogFields,

    /// Process ID that produced the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// Hostname where the record was produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl LogRecord {
    /// Create a record stamped with the current time
    pub fn new(level: LogLevel, message: impl Into<String>, fields: LogFields) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            fields,
            pid: None,
            hostname: None,
        }
    }

    /// Serialize to a single-line JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Format as a single human-readable line. Control characters in the
    /// message and keys are escaped so one record never spans lines.
    pub fn to_human_readable(&self) -> String {
        let timestamp = self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let mut line = format!("{} {:<5} ", timestamp, self.level);
        push_escaped(&mut line, &self.message);
        for (key, value) in self.fields.iter() {
            line.push(' ');
            push_escaped(&mut line, key);
            line.push('=');
            line.push_str(&value.to_string());
        }
        line
    }
}

fn push_escaped(line: &mut String, text: &str) {
    for c in text.chars() {
        if c.is_control() {
            line.extend(c.escape_default());
        } else {
            line.push(c);
        }
    }
}
