use std::fmt;

use serde::{Deserialize, Serialize};

use crate::key::Key;

/// A single attribute value inside a [`Node`](crate::Node).
///
/// Primitive attributes are stored inline; associations are stored as a
/// [`Value::Link`] carrying the key of the referenced node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent value (unset optional attribute or empty association).
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    /// Reference to another node by its content key.
    Link(Key),
}

impl Value {
    /// Short name of the value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Link(_) => "link",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<Key> {
        match self {
            Self::Link(k) => Some(*k),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Link(k) => write!(f, "&{}", k.short_hex()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<Key> for Value {
    fn from(k: Key) -> Self {
        Self::Link(k)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}

/// A `Value` whose kind did not match the requested Rust type.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueKindError {
    pub expected: &'static str,
    pub found: &'static str,
}

impl fmt::Display for ValueKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}, found {}", self.expected, self.found)
    }
}

impl std::error::Error for ValueKindError {}

macro_rules! try_from_value {
    ($ty:ty, $expected:literal, $($pat:pat => $out:expr),+) => {
        impl TryFrom<Value> for $ty {
            type Error = ValueKindError;

            fn try_from(value: Value) -> Result<Self, Self::Error> {
                match value {
                    $($pat => Ok($out),)+
                    other => Err(ValueKindError {
                        expected: $expected,
                        found: other.kind(),
                    }),
                }
            }
        }
    };
}

try_from_value!(bool, "bool", Value::Bool(b) => b);
try_from_value!(i64, "integer", Value::Integer(i) => i);
try_from_value!(f64, "float", Value::Float(x) => x, Value::Integer(i) => i as f64);
try_from_value!(String, "text", Value::Text(s) => s);
try_from_value!(Key, "link", Value::Link(k) => k);
