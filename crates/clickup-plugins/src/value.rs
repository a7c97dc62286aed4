//! Tagged value type carried by execution contexts, results and settings
//!
//! Plugins exchange data through string-keyed maps whose values may come from
//! anywhere: request parameters, decoded JSON responses, settings files, or
//! handles owned by the calling service. [`Value`] is the closed set of shapes
//! those values can take, and [`FromValue`] is the fail-closed conversion used
//! by every typed accessor in the crate.

use chrono::{DateTime, Utc};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A dynamically shaped value stored in a context, result or configuration map
#[derive(Clone, Default)]
pub enum Value {
    /// Absence of a value
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Structured payload, typically a decoded API response
    Json(serde_json::Value),
    /// Handle owned by the caller; only retrievable by downcasting
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Wrap an arbitrary shared object as an opaque value
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Self::Opaque(Arc::new(value))
    }

    /// Check whether this is [`Value::Null`] (or a JSON `null`)
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null | Self::Json(serde_json::Value::Null))
    }

    /// Short name of the variant, used in log summaries
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::Opaque(_) => "opaque",
        }
    }

    /// Convert into `T`, returning `None` when no sensible conversion exists
    #[must_use]
    pub fn get<T: FromValue>(&self) -> Option<T> {
        T::from_value(self)
    }

    /// Borrow the string content without converting
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Downcast an opaque value to the concrete type it was created from
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Self::Opaque(inner) => Arc::clone(inner).downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Deterministic textual form used when deriving cache keys
    ///
    /// Opaque handles have no stable content and all render identically.
    pub(crate) fn canonical(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => format!("b:{b}"),
            Self::Int(i) => format!("i:{i}"),
            Self::Float(f) => format!("f:{f}"),
            Self::String(s) => format!("s:{s}"),
            Self::Bytes(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
                format!("x:{hex}")
            }
            Self::Json(json) => format!("j:{}", canonical_json(json)),
            Self::Opaque(_) => "opaque".to_string(),
        }
    }
}

/// JSON rendering with object keys sorted, so map order never changes the output
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    let rendered = canonical_json(&map[key.as_str()]);
                    format!("{}:{}", serde_json::Value::String(key.clone()), rendered)
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        serde_json::Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Int(i) => f.debug_tuple("Int").field(i).finish(),
            Self::Float(x) => f.debug_tuple("Float").field(x).finish(),
            Self::String(s) => f.debug_tuple("String").field(s).finish(),
            Self::Bytes(b) => write!(f, "Bytes(<{} bytes>)", b.len()),
            Self::Json(j) => f.debug_tuple("Json").field(j).finish(),
            Self::Opaque(_) => write!(f, "Opaque(..)"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Json(j) => write!(f, "{j}"),
            Self::Opaque(_) => write!(f, "<opaque>"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Json(a), Self::Json(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        i64::try_from(value).map_or(Self::Float(value as f64), Self::Int)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Self::Float(value as f64), Self::Int)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::String(value.to_rfc3339())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Best-effort conversion out of a [`Value`]
///
/// Implementations never panic: a value that cannot be represented as `Self`
/// yields `None`, and callers substitute their default.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null | Value::Opaque(_) => None,
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Bytes(bytes) => String::from_utf8(bytes.clone()).ok(),
            Value::Json(serde_json::Value::Null) => None,
            Value::Json(serde_json::Value::String(s)) => Some(s.clone()),
            Value::Json(other) => Some(other.to_string()),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(*i),
            Value::Float(f) => float_to_i64(*f),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::String(s) => parse_i64(s),
            Value::Json(json) => match json {
                serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(float_to_i64)),
                serde_json::Value::String(s) => parse_i64(s),
                serde_json::Value::Bool(b) => Some(i64::from(*b)),
                _ => None,
            },
            _ => None,
        }
    }
}

fn parse_i64(s: &str) -> Option<i64> {
    let trimmed = s.trim();
    trimmed
        .parse::<i64>()
        .ok()
        .or_else(|| trimmed.parse::<f64>().ok().and_then(float_to_i64))
}

fn float_to_i64(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

macro_rules! from_value_via_i64 {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: &Value) -> Option<Self> {
                    i64::from_value(value).and_then(|i| <$ty>::try_from(i).ok())
                }
            }
        )*
    };
}

from_value_via_i64!(i32, u32, u64, usize);

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.trim().parse().ok(),
            Value::Json(serde_json::Value::Number(n)) => n.as_f64(),
            Value::Json(serde_json::Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) => Some(*f != 0.0),
            Value::String(s) => parse_bool(s),
            Value::Json(serde_json::Value::Bool(b)) => Some(*b),
            Value::Json(serde_json::Value::Number(n)) => n.as_f64().map(|f| f != 0.0),
            Value::Json(serde_json::Value::String(s)) => parse_bool(s),
            _ => None,
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bytes(bytes) => Some(bytes.clone()),
            Value::String(s) => Some(s.clone().into_bytes()),
            Value::Json(serde_json::Value::String(s)) => Some(s.clone().into_bytes()),
            _ => None,
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(serde_json::Value::Null),
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Int(i) => Some(serde_json::Value::from(*i)),
            Value::Float(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number),
            Value::String(s) => Some(serde_json::Value::String(s.clone())),
            Value::Bytes(bytes) => serde_json::to_value(bytes).ok(),
            Value::Json(json) => Some(json.clone()),
            Value::Opaque(_) => None,
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Option<Self> {
        value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exact_type_is_returned_unchanged() {
        assert_eq!(Value::Int(7).get::<i64>(), Some(7));
        assert_eq!(Value::from("abc").get::<String>(), Some("abc".to_string()));
        assert_eq!(Value::Bool(true).get::<bool>(), Some(true));
    }

    #[test]
    fn test_best_effort_numeric_conversions() {
        assert_eq!(Value::from("42").get::<i64>(), Some(42));
        assert_eq!(Value::from(" 42 ").get::<u32>(), Some(42));
        assert_eq!(Value::Float(3.0).get::<i64>(), Some(3));
        assert_eq!(Value::Float(3.5).get::<i64>(), None);
        assert_eq!(Value::Json(json!(15)).get::<usize>(), Some(15));
        assert_eq!(Value::Int(2).get::<f64>(), Some(2.0));
        assert_eq!(Value::Int(-1).get::<usize>(), None);
    }

    #[test]
    fn test_bool_conversions() {
        assert_eq!(Value::from("FALSE").get::<bool>(), Some(false));
        assert_eq!(Value::Int(1).get::<bool>(), Some(true));
        assert_eq!(Value::Json(json!(true)).get::<bool>(), Some(true));
        assert_eq!(Value::from("maybe").get::<bool>(), None);
    }

    #[test]
    fn test_mismatch_fails_closed() {
        assert_eq!(Value::from("not a number").get::<i64>(), None);
        assert_eq!(Value::Null.get::<String>(), None);
        assert_eq!(Value::opaque(5u8).get::<i64>(), None);
        assert_eq!(Value::Bytes(vec![0xff, 0xfe]).get::<String>(), None);
    }

    #[test]
    fn test_opaque_downcast() {
        #[derive(Debug, PartialEq)]
        struct Handle(u32);

        let value = Value::opaque(Handle(9));
        assert_eq!(value.downcast::<Handle>().as_deref(), Some(&Handle(9)));
        assert!(value.downcast::<String>().is_none());

        let clone = value.clone();
        assert_eq!(value, clone);
        assert_ne!(value, Value::opaque(Handle(9)));
    }

    #[test]
    fn test_canonical_json_ignores_key_order() {
        let a = Value::Json(json!({"b": 1, "a": {"y": 2, "x": 3}}));
        let b = Value::Json(json!({"a": {"x": 3, "y": 2}, "b": 1}));
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_canonical_distinguishes_types() {
        assert_ne!(Value::Int(1).canonical(), Value::from("1").canonical());
        assert_ne!(Value::Bool(true).canonical(), Value::from("true").canonical());
    }

    #[test]
    fn test_datetime_roundtrip_through_string() {
        let now = Utc::now();
        let value = Value::from(now);
        let parsed: DateTime<Utc> = value.get().unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }
}
