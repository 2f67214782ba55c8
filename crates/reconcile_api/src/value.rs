//! Dynamic value payloads
//!
//! The engine never interprets a value's fields. Descriptors receive a
//! [`Value`] and decide what it means for the southbound system; the
//! engine only compares values (through the descriptor's comparator,
//! structural equality by default) and stores them in the graph.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An opaque, comparable value payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Null value (distinct from "no value", which is a delete)
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Ordered list of values
    Array(Vec<Value>),
    /// Raw bytes, serialized as `{"$bytes": "<base64>"}`.
    ///
    /// Declared before `Object` so that the tagged form deserializes back
    /// into bytes rather than into a one-field object.
    #[serde(with = "base64_serde")]
    Bytes(Vec<u8>),
    /// Structured message, fields kept sorted by name
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Create an empty structured value
    pub fn object() -> Self {
        Self::Object(BTreeMap::new())
    }

    /// Builder-style field setter for structured values.
    ///
    /// Non-object values are turned into an object first.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if !matches!(self, Self::Object(_)) {
            self = Self::object();
        }
        self.set(key, value.into());
        self
    }

    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as i64
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to get as f64
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as array
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Try to get as object
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Get a field from an object value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object()?.get(key)
    }

    /// Set a field on an object value
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<()> {
        match self {
            Self::Object(o) => {
                o.insert(key.into(), value);
                Some(())
            }
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::String(s) => write!(f, "{:?}", s),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Self::Object(fields) => {
                write!(f, "{{")?;
                for (i, (name, item)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, item)?;
                }
                write!(f, "}}")
            }
            Self::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(items: Vec<V>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map: BTreeMap<String, Value> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::Object(map)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => match base64_serde::tagged_bytes(&fields) {
                Some(bytes) => Self::Bytes(bytes),
                None => Self::Object(
                    fields.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
                ),
            },
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
            Value::Bytes(bytes) => {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                let mut tagged = serde_json::Map::new();
                tagged.insert(base64_serde::TAG.to_string(), serde_json::Value::String(encoded));
                serde_json::Value::Object(tagged)
            }
        }
    }
}

/// Helper module for base64 serialization of bytes
mod base64_serde {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub const TAG: &str = "$bytes";

    #[derive(Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Tagged {
        #[serde(rename = "$bytes")]
        bytes: String,
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        Tagged {
            bytes: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let tagged = Tagged::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&tagged.bytes)
            .map_err(serde::de::Error::custom)
    }

    /// Bytes of a JSON object in the tagged form
    pub fn tagged_bytes(fields: &serde_json::Map<String, serde_json::Value>) -> Option<Vec<u8>> {
        if fields.len() != 1 {
            return None;
        }
        let encoded = fields.get(TAG)?.as_str()?;
        base64::engine::general_purpose::STANDARD.decode(encoded).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_types() {
        assert!(Value::Null.is_null());
        assert_eq!(Value::from(42).as_int(), Some(42));
        assert_eq!(Value::from(2.5).as_float(), Some(2.5));
        assert_eq!(Value::from("hello").as_str(), Some("hello"));
    }

    #[test]
    fn test_object_builder() {
        let v = Value::object().with("mtu", 1500).with("name", "eth0");
        assert_eq!(v.get("mtu").and_then(|v| v.as_int()), Some(1500));
        assert_eq!(v.get("name").and_then(|v| v.as_str()), Some("eth0"));
        assert_eq!(v.to_string(), "{mtu: 1500, name: \"eth0\"}");
    }

    #[test]
    fn test_structural_equality() {
        let a = Value::object().with("a", 1).with("b", vec![1, 2]);
        let b = Value::object().with("b", vec![1, 2]).with("a", 1);
        assert_eq!(a, b);
        assert_ne!(a, Value::object().with("a", 1));
    }

    #[test]
    fn test_bytes_survive_serialization() {
        let value = Value::object()
            .with("mac", Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]))
            .with("name", "eth0");
        let encoded = serde_json::to_string(&value).unwrap();
        assert_eq!(encoded, r#"{"mac":{"$bytes":"3q2+7w=="},"name":"eth0"}"#);
        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, value);

        let json = serde_json::Value::from(&value);
        assert_eq!(Value::from(json), value);

        // plain strings stay strings even when they look like base64
        let decoded: Value = serde_json::from_str(r#""3q2+7w==""#).unwrap();
        assert_eq!(decoded, Value::from("3q2+7w=="));
        let decoded: Value = serde_json::from_str(r#"{"$bytes":"3q2+7w==","x":1}"#).unwrap();
        assert!(matches!(decoded, Value::Object(_)));
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!({"enabled": true, "ips": ["10.0.0.1"], "mtu": 9000});
        let value = Value::from(json.clone());
        assert_eq!(value.get("mtu"), Some(&Value::Int(9000)));
        assert_eq!(serde_json::Value::from(&value), json);
    }
}
