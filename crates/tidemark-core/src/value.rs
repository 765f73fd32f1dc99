//! Column values and rows.
//!
//! [`Value`] mirrors the storage classes of an embedded relational store, so a
//! value read back from a table compares equal to the value that was written.

use crate::hlc::{Timestamp, TimestampError};
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A row keyed by column name. Ordered so payloads serialize deterministically.
pub type Row = BTreeMap<String, Value>;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL NULL
    #[default]
    Null,
    /// 64-bit signed integer (also used for booleans)
    Integer(i64),
    /// 64-bit float
    Real(f64),
    /// UTF-8 text (also used for JSON documents and HLC strings)
    Text(String),
    /// Raw bytes
    Blob(Vec<u8>),
}

impl Value {
    /// Returns `true` for SQL NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow the text content, if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the integer content, if this is an integer value.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Interpret the value as an encoded HLC.
    ///
    /// NULL maps to `None`.
    ///
    /// # Errors
    ///
    /// Returns error if the value is neither NULL nor a well-formed timestamp string.
    pub fn as_timestamp(&self) -> Result<Option<Timestamp>, TimestampError> {
        match self {
            Self::Null => Ok(None),
            Self::Text(s) => Timestamp::parse(s).map(Some),
            other => Err(TimestampError::Malformed(format!("{other:?}"))),
        }
    }

    /// Short name of the storage class, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl From<&Timestamp> for Value {
    fn from(ts: &Timestamp) -> Self {
        Self::Text(ts.encode())
    }
}

impl From<Timestamp> for Value {
    fn from(ts: Timestamp) -> Self {
        Self::Text(ts.encode())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("null, a boolean, a number, a string, or an array of bytes")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(self)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Integer(v))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(i64::try_from(v).map_or(Value::Real(v as f64), Value::Integer))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Real(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::Text(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Blob(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Value, E> {
        Ok(Value::Blob(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        Ok(Value::Blob(bytes))
    }
}

/// Build a [`Row`] from `column => value` pairs.
///
/// ```
/// use tidemark_core::{row, Value};
///
/// let r = row! { "title" => "x", "done" => false };
/// assert_eq!(r["done"], Value::Integer(0));
/// ```
#[macro_export]
macro_rules! row {
    () => { $crate::Row::new() };
    ($($column:expr => $value:expr),+ $(,)?) => {{
        let mut row = $crate::Row::new();
        $(row.insert(::std::string::String::from($column), $crate::Value::from($value));)+
        row
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::NodeId;

    #[test]
    fn json_values_map_to_storage_classes() {
        let row: Row = serde_json::from_str(
            r#"{"a": null, "b": true, "c": 7, "d": 1.5, "e": "x", "f": [1, 2, 255]}"#,
        )
        .unwrap();

        assert_eq!(row["a"], Value::Null);
        assert_eq!(row["b"], Value::Integer(1));
        assert_eq!(row["c"], Value::Integer(7));
        assert_eq!(row["d"], Value::Real(1.5));
        assert_eq!(row["e"], Value::Text("x".into()));
        assert_eq!(row["f"], Value::Blob(vec![1, 2, 255]));
    }

    #[test]
    fn huge_unsigned_falls_back_to_real() {
        let v: Value = serde_json::from_str("18446744073709551615").unwrap();
        assert!(matches!(v, Value::Real(_)));
    }

    #[test]
    fn rejects_nested_objects() {
        assert!(serde_json::from_str::<Value>(r#"{"nested": 1}"#).is_err());
    }

    #[test]
    fn timestamp_values() {
        let ts = Timestamp::new(5, 1, NodeId::new("n").unwrap());
        assert_eq!(Value::from(&ts).as_timestamp().unwrap(), Some(ts));
        assert_eq!(Value::Null.as_timestamp().unwrap(), None);
        assert!(Value::Integer(3).as_timestamp().is_err());
    }

    #[test]
    fn row_macro_builds_ordered_rows() {
        let r = row! { "b" => 2, "a" => "one", "c" => Option::<i64>::None };
        let keys: Vec<_> = r.keys().cloned().collect();
        assert_eq!(keys, ["a", "b", "c"]);
        assert!(r["c"].is_null());
    }
}
