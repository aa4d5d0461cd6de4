//! Record types for storing data.

use crate::{Field, RecordKey, StoreId};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Field data of a record, keyed by field name.
pub type Data = BTreeMap<String, Field>;

/// A keyed record held by a store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    /// Primary key, unique within the store
    pub key: RecordKey,
    /// Field values
    pub data: Data,
    /// Child store occupying this record, set by `generate`
    pub nested: Option<StoreId>,
}

impl Record {
    /// Create a record from a JSON object, classifying every field.
    pub fn new(key: impl Into<RecordKey>, data: Map<String, Value>) -> Self {
        Self {
            key: key.into(),
            data: classify(data),
            nested: None,
        }
    }

    /// Create a record with no fields.
    pub fn empty(key: impl Into<RecordKey>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    /// Get a field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.data.get(name)
    }

    /// Merge fields into this record, replacing existing values.
    pub fn merge(&mut self, data: Map<String, Value>) {
        self.data.extend(classify(data));
    }

    /// Every child store referenced by this record.
    pub fn child_stores(&self) -> Vec<StoreId> {
        self.nested
            .into_iter()
            .chain(self.data.values().filter_map(Field::as_store))
            .collect()
    }

    /// Render the record data as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.data
                .iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect(),
        )
    }

    /// Render `{key, data}` for notifications.
    pub fn to_event(&self) -> Value {
        serde_json::json!({ "key": self.key, "data": self.to_json() })
    }
}

/// Classify every value of a JSON object into [`Field`]s.
pub fn classify(data: Map<String, Value>) -> Data {
    data.into_iter().map(|(k, v)| (k, Field::from(v))).collect()
}
