//! Dynamic property values.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A dynamically-typed property value.
///
/// Entity instances, shadow storage, keys and foreign keys all hold
/// `Value`s; the relational store exchanges them with the session through
/// rows and change sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 8-bit signed integer
    TinyInt(i8),

    /// 16-bit signed integer
    SmallInt(i16),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 32-bit floating point
    Float(f32),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(i64::from(*v)),
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Compare two values the way key and foreign-key matching does.
    ///
    /// Integers of different widths compare by numeric value and floats
    /// compare bitwise, so a key read back from a row matches the key the
    /// caller assigned even when the store widened the column type.
    pub fn key_eq(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_key_integer(), other.as_key_integer()) {
            return a == b;
        }
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }

    /// Hash this value consistently with [`Value::key_eq`].
    pub fn hash_key<H: Hasher>(&self, hasher: &mut H) {
        if let Some(i) = self.as_key_integer() {
            5u8.hash(hasher);
            i.hash(hasher);
            return;
        }
        match self {
            Value::Null => 0u8.hash(hasher),
            Value::Bool(b) => {
                1u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Float(f) => {
                6u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Double(f) => {
                7u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Decimal(s) => {
                8u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Text(s) => {
                9u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Bytes(b) => {
                10u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Date(d) => {
                11u8.hash(hasher);
                d.hash(hasher);
            }
            Value::Timestamp(ts) => {
                13u8.hash(hasher);
                ts.hash(hasher);
            }
            Value::Uuid(u) => {
                15u8.hash(hasher);
                u.hash(hasher);
            }
            Value::Json(j) => {
                16u8.hash(hasher);
                j.to_string().hash(hasher);
            }
            Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {}
        }
    }

    fn as_key_integer(&self) -> Option<i64> {
        match self {
            Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
                self.as_i64()
            }
            _ => None,
        }
    }
}

/// Compare two value slices element-wise with [`Value::key_eq`].
pub fn key_values_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.key_eq(y))
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::TinyInt(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
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

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
