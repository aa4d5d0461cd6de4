//! In-memory REST collections.
//!
//! Each collection is an ordered list of JSON objects carrying an `id`
//! field. Collections spring into existence on first write.

use crate::config::ConfigError;
use crate::error::{AppError, Result};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use tether_engine::Verb;

/// Field holding a record's identifier.
pub const ID_FIELD: &str = "id";

/// Records of one collection, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    records: Vec<Map<String, Value>>,
}

impl Collection {
    fn position(&self, id: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|record| record.get(ID_FIELD).map(id_text).as_deref() == Some(id))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Identifier text of an `id` value; numbers and strings both address a record.
fn id_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Every collection the server holds.
#[derive(Debug, Default)]
pub struct Collections {
    collections: DashMap<String, Collection>,
    read_only: HashSet<String>,
}

impl Collections {
    pub fn new(read_only: HashSet<String>) -> Self {
        Self {
            collections: DashMap::new(),
            read_only,
        }
    }

    /// Load collections from a seed file.
    pub fn load(&self, path: &Path) -> std::result::Result<usize, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let seed: Value = serde_json::from_str(&text).map_err(|e| ConfigError::InvalidSeed(e.to_string()))?;
        self.seed(seed)
    }

    /// Add records from `{"name": [records]}`. Returns the record count.
    ///
    /// Records without an `id` are given one.
    pub fn seed(&self, seed: Value) -> std::result::Result<usize, ConfigError> {
        let seed = match seed {
            Value::Object(map) => map,
            _ => return Err(ConfigError::InvalidSeed("expected an object of collections".into())),
        };

        let mut count = 0;
        for (name, records) in seed {
            let records = match records {
                Value::Array(records) => records,
                _ => return Err(ConfigError::InvalidSeed(format!("'{}' is not an array", name))),
            };

            let mut collection = self.collections.entry(name.clone()).or_default();
            for record in records {
                let mut record = match record {
                    Value::Object(record) => record,
                    _ => return Err(ConfigError::InvalidSeed(format!("'{}' holds a non-object", name))),
                };
                record
                    .entry(ID_FIELD)
                    .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
                collection.records.push(record);
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn is_read_only(&self, collection: &str) -> bool {
        self.read_only.contains(collection)
    }

    /// Verbs a collection or one of its records accepts.
    pub fn allowed(&self, collection: &str, item: bool) -> Vec<Verb> {
        let mut verbs = vec![Verb::Get, Verb::Head, Verb::Options];
        if !self.is_read_only(collection) {
            if item {
                verbs.extend([Verb::Put, Verb::Delete]);
            } else {
                verbs.push(Verb::Post);
            }
        }
        verbs
    }

    /// `Allow` header value for a collection or one of its records.
    pub fn allow(&self, collection: &str, item: bool) -> String {
        self.allowed(collection, item)
            .iter()
            .map(Verb::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `Allow` header value for a request path, if it names a resource.
    pub fn allow_for_path(&self, path: &str) -> Option<String> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            [""] | ["health"] => Some("GET, HEAD".to_string()),
            [collection] => Some(self.allow(collection, false)),
            [collection, _] => Some(self.allow(collection, true)),
            _ => None,
        }
    }

    fn writable(&self, collection: &str, item: bool) -> Result<()> {
        if self.is_read_only(collection) {
            return Err(AppError::MethodNotAllowed(self.allow(collection, item)));
        }
        Ok(())
    }

    /// Every record of a collection. Unknown collections are empty.
    pub fn list(&self, collection: &str) -> Vec<Value> {
        self.collections
            .get(collection)
            .map(|c| c.records.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, collection: &str, id: &str) -> Result<Value> {
        self.collections
            .get(collection)
            .and_then(|c| c.position(id).map(|i| Value::Object(c.records[i].clone())))
            .ok_or_else(|| not_found(collection, id))
    }

    /// Add a record. A client-supplied `id` is kept, otherwise a UUID is
    /// assigned. Returns the id and the stored record.
    pub fn create(&self, collection: &str, body: Value) -> Result<(String, Value)> {
        self.writable(collection, false)?;
        let mut record = object(body)?;

        let id = match record.get(ID_FIELD) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(value @ Value::Number(_)) => id_text(value),
            Some(Value::Null) | None => uuid::Uuid::new_v4().to_string(),
            Some(_) => return Err(AppError::BadRequest("id must be a string or number".into())),
        };

        let mut entry = self.collections.entry(collection.to_string()).or_default();
        if entry.position(&id).is_some() {
            return Err(AppError::Conflict(format!("{}/{} already exists", collection, id)));
        }
        if !record.contains_key(ID_FIELD) || record[ID_FIELD].is_null() {
            record.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        }
        entry.records.push(record.clone());

        tracing::debug!(collection = %collection, id = %id, "Created record");
        Ok((id, Value::Object(record)))
    }

    /// Replace a record's fields, keeping its `id`.
    pub fn replace(&self, collection: &str, id: &str, body: Value) -> Result<Value> {
        self.writable(collection, true)?;
        let mut record = object(body)?;

        let mut entry = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| not_found(collection, id))?;
        let position = entry.position(id).ok_or_else(|| not_found(collection, id))?;

        let stored_id = entry.records[position]
            .get(ID_FIELD)
            .cloned()
            .unwrap_or_else(|| Value::String(id.to_string()));
        record.insert(ID_FIELD.to_string(), stored_id);
        entry.records[position] = record.clone();

        tracing::debug!(collection = %collection, id = %id, "Replaced record");
        Ok(Value::Object(record))
    }

    pub fn remove(&self, collection: &str, id: &str) -> Result<()> {
        self.writable(collection, true)?;

        let mut entry = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| not_found(collection, id))?;
        let position = entry.position(id).ok_or_else(|| not_found(collection, id))?;
        entry.records.remove(position);

        tracing::debug!(collection = %collection, id = %id, "Removed record");
        Ok(())
    }

    /// Number of records in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.collections.get(collection).map(|c| c.len()).unwrap_or(0)
    }
}

fn object(body: Value) -> Result<Map<String, Value>> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::BadRequest("record must be a JSON object".into())),
    }
}

fn not_found(collection: &str, id: &str) -> AppError {
    AppError::NotFound(format!("{}/{}", collection, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users() -> Collections {
        let collections = Collections::new(["tags".to_string()].into_iter().collect());
        collections
            .seed(json!({
                "users": [{"id": 1, "name": "Ann"}, {"name": "Bob"}],
                "tags": [{"id": "red"}],
            }))
            .unwrap();
        collections
    }

    #[test]
    fn seed_assigns_missing_ids() {
        let collections = users();
        assert_eq!(collections.count("users"), 2);
        let list = collections.list("users");
        assert_eq!(list[0]["id"], json!(1));
        assert!(list[1]["id"].as_str().is_some_and(|id| id.len() == 36));
    }

    #[test]
    fn seed_rejects_bad_shapes() {
        let collections = Collections::default();
        assert!(matches!(collections.seed(json!([])), Err(ConfigError::InvalidSeed(_))));
        assert!(matches!(collections.seed(json!({"a": {}})), Err(ConfigError::InvalidSeed(_))));
        assert!(matches!(collections.seed(json!({"a": [1]})), Err(ConfigError::InvalidSeed(_))));
    }

    #[test]
    fn numeric_ids_are_addressable_as_text() {
        let collections = users();
        assert_eq!(collections.get("users", "1").unwrap()["name"], "Ann");
        assert!(matches!(collections.get("users", "2"), Err(AppError::NotFound(_))));
        assert!(matches!(collections.get("nope", "1"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn create_keeps_or_assigns_id() {
        let collections = users();
        let (id, record) = collections.create("users", json!({"name": "Cy"})).unwrap();
        assert_eq!(record["id"], json!(id));

        let (id, _) = collections.create("users", json!({"id": 7, "name": "Di"})).unwrap();
        assert_eq!(id, "7");
        assert!(matches!(
            collections.create("users", json!({"id": "7"})),
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(collections.create("users", json!([1])), Err(AppError::BadRequest(_))));
        assert_eq!(collections.count("users"), 4);
    }

    #[test]
    fn replace_keeps_stored_id() {
        let collections = users();
        let record = collections.replace("users", "1", json!({"id": 99, "name": "Ana"})).unwrap();
        assert_eq!(record, json!({"id": 1, "name": "Ana"}));
        assert_eq!(collections.list("users")[0]["name"], "Ana");
    }

    #[test]
    fn remove_drops_record() {
        let collections = users();
        collections.remove("users", "1").unwrap();
        assert_eq!(collections.count("users"), 1);
        assert!(matches!(collections.remove("users", "1"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn read_only_collections_reject_writes() {
        let collections = users();
        assert!(matches!(
            collections.create("tags", json!({})),
            Err(AppError::MethodNotAllowed(allow)) if allow == "GET, HEAD, OPTIONS"
        ));
        assert!(matches!(collections.remove("tags", "red"), Err(AppError::MethodNotAllowed(_))));
        assert_eq!(collections.count("tags"), 1);
    }

    #[test]
    fn allow_by_path() {
        let collections = users();
        assert_eq!(collections.allow_for_path("/users").unwrap(), "GET, HEAD, OPTIONS, POST");
        assert_eq!(
            collections.allow_for_path("/users/1").unwrap(),
            "GET, HEAD, OPTIONS, PUT, DELETE"
        );
        assert_eq!(collections.allow_for_path("/tags/red").unwrap(), "GET, HEAD, OPTIONS");
        assert_eq!(collections.allow_for_path("/health").unwrap(), "GET, HEAD");
        assert!(collections.allow_for_path("/a/b/c").is_none());
    }
}
