use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::ExportError;

/// A producer object of unknown shape that can describe itself in one or more ways.
///
/// Every method is optional. The sanitizer asks for `to_dict`, then `to_json`, then `render`,
/// and uses the first that succeeds.
pub trait Exportable: Send + Sync {
    fn to_dict(&self) -> Result<Payload, ExportError> {
        Err(ExportError::Unsupported)
    }

    fn to_json(&self) -> Result<String, ExportError> {
        Err(ExportError::Unsupported)
    }

    fn render(&self) -> Result<String, ExportError> {
        Err(ExportError::Unsupported)
    }
}

/// Anything a producer can hand to the event queue.
#[derive(Clone)]
pub enum Payload {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Time(DateTime<Utc>),
    Bytes(Vec<u8>),
    Map(Vec<(Payload, Payload)>),
    List(Vec<Payload>),
    Object(Arc<dyn Exportable>),
}

impl Payload {
    pub fn object(obj: impl Exportable + 'static) -> Self {
        Self::Object(Arc::new(obj))
    }

    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<Payload>,
        V: Into<Payload>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Looks up a text-keyed entry of a `Map` payload.
    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Self::Map(entries) => entries.iter().find_map(|(k, v)| match k {
                Self::Text(s) if s == key => Some(v),
                _ => None,
            }),
            _ => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Int(i) => f.debug_tuple("Int").field(i).finish(),
            Self::UInt(u) => f.debug_tuple("UInt").field(u).finish(),
            Self::Float(x) => f.debug_tuple("Float").field(x).finish(),
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::Time(t) => f.debug_tuple("Time").field(t).finish(),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Map(entries) => f.debug_map().entries(entries.iter().map(|(k, v)| (k, v))).finish(),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Object(_) => f.write_str("Object(..)"),
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::UInt(u)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Self::Text(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (Self::Text(k), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Payload {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Payload {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<DateTime<Utc>> for Payload {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Time(t)
    }
}

impl From<Vec<Payload>> for Payload {
    fn from(items: Vec<Payload>) -> Self {
        Self::List(items)
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Self::Null)
    }
}
