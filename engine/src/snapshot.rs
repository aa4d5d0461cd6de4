//! Snapshots for persisting and restoring store contents.
//!
//! A store saves as `{total, keys, records}` under its name; a single record
//! saves as its data object under its key. Child store fields persist as the
//! child's endpoint, or null when it has none, so a restored record can be
//! crawled again.

use crate::error::{Error, Result};
use crate::store::{Selector, Store};
use crate::{Field, Record};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub key: String,
    pub data: Map<String, Value>,
}

/// A point-in-time copy of a store's records.
///
/// Uses BTreeMap for the key map so serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Number of records
    pub total: usize,
    /// Key to position map
    pub keys: BTreeMap<String, usize>,
    /// Records in order
    pub records: Vec<SnapshotRecord>,
}

impl StoreSnapshot {
    /// Check internal consistency.
    ///
    /// `total` must equal the record count and every key must map to the
    /// position of the record carrying it.
    pub fn validate(&self) -> Result<()> {
        if self.total != self.records.len() {
            return Err(Error::InvalidSnapshot(format!(
                "total {} does not match {} records",
                self.total,
                self.records.len()
            )));
        }
        if self.keys.len() != self.records.len() {
            return Err(Error::InvalidSnapshot(format!(
                "{} keys for {} records",
                self.keys.len(),
                self.records.len()
            )));
        }

        for (key, &position) in &self.keys {
            match self.records.get(position) {
                Some(record) if &record.key == key => {}
                _ => {
                    return Err(Error::InvalidSnapshot(format!(
                        "key '{}' does not map to its record",
                        key
                    )))
                }
            }
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// String key-value persistence.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: String) -> Result<()>;

    /// Remove a key. Returns `false` if it was absent.
    fn remove(&self, key: &str) -> Result<bool>;
}

/// In-memory [`Storage`].
#[derive(Default)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

impl Store {
    /// Persist the record data, rendering child stores as their endpoints.
    fn persisted(&self, record: &Record) -> Map<String, Value> {
        record
            .data
            .iter()
            .map(|(field, value)| {
                let value = match value {
                    Field::Store(id) => self
                        .engine()
                        .store(*id)
                        .and_then(|child| child.uri())
                        .map(Value::String)
                        .unwrap_or(Value::Null),
                    other => other.to_value(),
                };
                (field.clone(), value)
            })
            .collect()
    }

    /// Current contents as a snapshot.
    pub fn snapshot(&self) -> StoreSnapshot {
        let records: Vec<SnapshotRecord> = self
            .records()
            .iter()
            .map(|record| SnapshotRecord {
                key: record.key.clone(),
                data: self.persisted(record),
            })
            .collect();

        StoreSnapshot {
            total: records.len(),
            keys: records
                .iter()
                .enumerate()
                .map(|(i, r)| (r.key.clone(), i))
                .collect(),
            records,
        }
    }

    /// Save the whole store under its name.
    pub fn save(&self, storage: &dyn Storage) -> Result<StoreSnapshot> {
        let snapshot = self.snapshot();
        storage.set(&self.name()?, snapshot.to_json()?)?;
        tracing::debug!(store = %self.id(), items = snapshot.total, "Saved store");
        Ok(snapshot)
    }

    /// Replace the store contents with the snapshot saved under its name.
    ///
    /// The snapshot is validated first; an invalid one leaves the store
    /// untouched.
    pub fn restore(&self, storage: &dyn Storage) -> Result<()> {
        let name = self.name()?;
        let json = storage
            .get(&name)?
            .ok_or_else(|| Error::invalid(format!("nothing saved under '{}'", name)))?;
        let snapshot = StoreSnapshot::from_json(&json)?;
        let total = snapshot.total;

        let records = snapshot
            .records
            .into_iter()
            .map(|r| Record::new(r.key, r.data))
            .collect();

        let children = self.engine().write(self.id(), |s| {
            let children = s.reset();
            s.index.replace(records);
            s.loaded = true;
            children
        })?;
        self.release_children(children);

        tracing::debug!(store = %self.id(), items = total, "Restored store");
        Ok(())
    }

    /// Drop the saved store. Returns `false` if nothing was saved.
    pub fn forget(&self, storage: &dyn Storage) -> Result<bool> {
        storage.remove(&self.name()?)
    }

    /// Save one record's data under its key.
    pub fn save_record(&self, selector: impl Into<Selector>, storage: &dyn Storage) -> Result<()> {
        let selector = selector.into();
        let record = self
            .record(selector.clone())
            .ok_or_else(|| Error::invalid(format!("no record for {:?}", selector)))?;
        let json = serde_json::to_string(&self.persisted(&record))
            .map_err(|e| Error::Storage(e.to_string()))?;
        storage.set(&record.key, json)
    }

    /// Load a record saved under `key` back into the store, locally.
    pub fn restore_record(&self, key: &str, storage: &dyn Storage) -> BoxFuture<'static, Result<Record>> {
        let loaded = storage.get(key).and_then(|json| {
            let json = json.ok_or_else(|| Error::invalid(format!("nothing saved under '{}'", key)))?;
            serde_json::from_str::<Value>(&json).map_err(|e| Error::InvalidSnapshot(e.to_string()))
        });

        match loaded {
            Ok(data) => self.set(Some(key), data, true),
            Err(e) => crate::store::fail(e),
        }
    }

    /// Drop a saved record. Returns `false` if nothing was saved.
    pub fn forget_record(&self, key: &str, storage: &dyn Storage) -> Result<bool> {
        storage.remove(key)
    }
}
