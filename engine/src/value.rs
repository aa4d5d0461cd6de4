//! Field values held by records.
//!
//! Record data is classified once, when it enters a store, into a tagged
//! [`Field`]. The crawler and the sort engine match on the variant instead of
//! probing the shape of raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Opaque identifier of a store inside an engine arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreId(pub(crate) u64);

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store-{}", self.0)
    }
}

/// A single field of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// Null, boolean, number or string
    Primitive(Value),
    /// A JSON array
    Sequence(Vec<Value>),
    /// A JSON object
    Composite(Map<String, Value>),
    /// A child store created by crawling this field
    Store(StoreId),
}

impl Field {
    /// Render the field back to JSON. A child store renders as its id.
    pub fn to_value(&self) -> Value {
        match self {
            Field::Primitive(v) => v.clone(),
            Field::Sequence(items) => Value::Array(items.clone()),
            Field::Composite(map) => Value::Object(map.clone()),
            Field::Store(id) => Value::String(id.to_string()),
        }
    }

    /// The child store referenced by this field, if any.
    pub fn as_store(&self) -> Option<StoreId> {
        match self {
            Field::Store(id) => Some(*id),
            _ => None,
        }
    }

    /// String form used for sorting and searching.
    ///
    /// Strings render bare, other primitives through their JSON text. Child
    /// stores have no text.
    pub fn text(&self) -> Option<String> {
        match self {
            Field::Primitive(Value::String(s)) => Some(s.clone()),
            Field::Primitive(Value::Null) => Some("null".to_string()),
            Field::Primitive(v) => Some(v.to_string()),
            Field::Sequence(_) | Field::Composite(_) => Some(self.to_value().to_string()),
            Field::Store(_) => None,
        }
    }
}

impl From<Value> for Field {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => Field::Sequence(items),
            Value::Object(map) => Field::Composite(map),
            other => Field::Primitive(other),
        }
    }
}

/// Walk a dotted/bracketed path (`a.b[0].c`) into a JSON value.
///
/// Returns `None` when any segment is missing.
pub fn walk<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let normalized = path.trim_end_matches(']').replace(']', ".");
    let mut current = value;

    for segment in normalized.split(['.', '[']).filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Render a key value as text. Strings render bare.
pub(crate) fn key_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Apply an optional `source` path, cloning the addressed value.
pub(crate) fn extract(value: Value, source: Option<&str>) -> Option<Value> {
    match source {
        None => Some(value),
        Some(path) => walk(&value, path).cloned(),
    }
}
