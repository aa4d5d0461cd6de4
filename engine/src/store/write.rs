//! Single-record mutations: `set` and `del`.
//!
//! Both operations validate, reserve the key and run permission pre-flight
//! synchronously, before the returned future is first polled. Only the
//! network round trip and the final commit happen asynchronously.

use super::{fail, MutationGuard, Selector, Store};
use crate::client::RequestOptions;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::transport::Verb;
use crate::value::{extract, key_text};
use crate::{uri, Field, Record};
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

/// Synchronous half of a `set`.
struct SetPlan {
    key: Option<String>,
    data: Map<String, Value>,
    existing: bool,
    provisional: bool,
    sync: bool,
    request: Option<(Verb, String)>,
    config: StoreConfig,
    options: RequestOptions,
    _guard: Option<MutationGuard>,
}

impl Store {
    /// Create or update a record.
    ///
    /// `key` may be omitted only when the store has an endpoint; the server
    /// then assigns it. An array `data` replaces the record with a generated
    /// child store holding the items. With `sync` the change is applied
    /// locally only.
    ///
    /// Resolves to the stored record.
    pub fn set(&self, key: Option<&str>, data: Value, sync: bool) -> BoxFuture<'static, Result<Record>> {
        let key = key.filter(|k| !k.is_empty()).map(str::to_string);

        match data {
            Value::Array(items) => self.set_collection(key, items),
            Value::Object(map) => match self.plan_set(key, map, sync) {
                Ok(plan) => {
                    let store = self.clone();
                    Box::pin(async move { store.complete_set(plan).await })
                }
                Err(e) => fail(e),
            },
            _ => fail(Error::invalid("record data must be an object")),
        }
    }

    fn plan_set(&self, key: Option<String>, data: Map<String, Value>, sync: bool) -> Result<SetPlan> {
        let (config, existing) = self.engine.read(self.id, |s| {
            let existing = key.as_deref().map(|k| s.index.contains(k)).unwrap_or(false);
            (s.config.clone(), existing)
        })?;

        let endpoint = match (&key, &config.uri) {
            (None, None) => return Err(Error::invalid("a key is required without an endpoint")),
            (_, endpoint) => endpoint.clone(),
        };

        let request = match endpoint {
            Some(endpoint) if !sync && config.callback.is_none() => {
                let (verb, target) = match (&key, existing) {
                    (Some(k), true) => (Verb::Put, uri::join(&endpoint, k)),
                    _ => (Verb::Post, endpoint),
                };

                if self.engine.client().allows(&target, verb) == Some(false) {
                    tracing::warn!(store = %self.id, uri = %target, verb = %verb, "Set denied by cached permission");
                    self.notify(
                        Event::FailedDataSet,
                        json!({"key": key, "error": Error::ServerInvalidMethod.to_string()}),
                    );
                    return Err(Error::ServerInvalidMethod);
                }
                Some((verb, target))
            }
            _ => None,
        };

        // Only mutations with a round trip stay in flight
        let guard = match (&key, &request) {
            (Some(k), Some(_)) => Some(self.guard(k)?),
            _ => None,
        };

        self.notify(Event::BeforeDataSet, json!({"key": key, "data": data}));

        // Reserve the slot so reads issued before completion see the record
        let provisional = match &key {
            Some(k) if !existing => {
                let reserved = Record::empty(k.as_str());
                self.engine.write(self.id, |s| {
                    s.index.upsert(reserved);
                    s.invalidate();
                })?;
                true
            }
            _ => false,
        };

        Ok(SetPlan {
            key,
            data,
            existing,
            provisional,
            sync,
            request,
            options: RequestOptions::from(&config),
            config,
            _guard: guard,
        })
    }

    async fn complete_set(&self, plan: SetPlan) -> Result<Record> {
        let key = plan.key.clone();
        let provisional = plan.provisional;
        let sync = plan.sync;

        match self.commit_set(plan).await {
            Ok(record) => {
                tracing::debug!(store = %self.id, key = %record.key, sync, "Set record");
                if sync {
                    self.notify(Event::SyncDataSet, record.to_event());
                }
                self.notify(Event::AfterDataSet, record.to_event());
                Ok(record)
            }
            Err(e) => {
                if let (true, Some(k)) = (provisional, &key) {
                    let _ = self.engine.write(self.id, |s| {
                        if s.index.get(k).is_some_and(|r| r.data.is_empty()) {
                            s.index.remove(k);
                            s.invalidate();
                        }
                    });
                }
                tracing::warn!(store = %self.id, key = ?key, error = %e, "Set failed");
                self.notify(Event::FailedDataSet, json!({"key": key, "error": e.to_string()}));
                Err(e)
            }
        }
    }

    async fn commit_set(&self, plan: SetPlan) -> Result<Record> {
        let SetPlan {
            key,
            data,
            existing,
            request,
            config,
            options,
            ..
        } = plan;
        let client = self.engine.client().clone();

        let response = match request {
            Some((verb, target)) => client.request(verb, &target, Some(Value::Object(data.clone())), &options).await?,
            None => None,
        };

        let (key, mut data) = match key {
            Some(key) => (key, data),
            None => {
                let result = response
                    .and_then(|r| extract(r, config.source.as_deref()))
                    .ok_or(Error::ExpectedObject)?;
                let mut result = match result {
                    Value::Object(map) => map,
                    _ => return Err(Error::ExpectedObject),
                };
                let assigned = match &config.key {
                    Some(field) => result.remove(field),
                    None => result.values().next().cloned(),
                }
                .ok_or(Error::ExpectedObject)?;
                (key_text(&assigned), result)
            }
        };

        if let Some(field) = &config.key {
            data.remove(field);
        }

        if !existing {
            if let Some(pointer) = config.pointer.as_deref().filter(|p| data.contains_key(*p)) {
                let target = data[pointer].clone();
                data = self.follow_pointer(&target, &config, &options).await?;
            }
        }

        let (record, replaced) = self.engine.write(self.id, |s| {
            s.invalidate();
            let replaced: Vec<_> = match s.index.get(&key) {
                Some(current) => data
                    .keys()
                    .filter_map(|field| current.field(field).and_then(Field::as_store))
                    .collect(),
                None => Vec::new(),
            };
            if !replaced.is_empty() {
                s.collections.retain(|c| !data.contains_key(c));
            }

            let record = match s.index.get_mut(&key) {
                Some(current) => {
                    current.merge(data);
                    current.clone()
                }
                None => {
                    let record = Record::new(key.as_str(), data);
                    s.index.upsert(record.clone());
                    record
                }
            };
            (record, replaced)
        })?;
        self.release_children(replaced);

        if config.retrieve {
            return self.crawl(Selector::Key(record.key.clone())).await;
        }
        Ok(record)
    }

    async fn follow_pointer(
        &self,
        target: &Value,
        config: &StoreConfig,
        options: &RequestOptions,
    ) -> Result<Map<String, Value>> {
        let reference = match target {
            Value::String(s) if !s.is_empty() => s.as_str(),
            _ => return Err(Error::ExpectedObject),
        };
        let target = match &config.uri {
            Some(base) => uri::resolve(base, reference),
            None => reference.to_string(),
        };

        let fetched = self.engine.client().get(&target, options).await?;
        match fetched.and_then(|v| extract(v, config.source.as_deref())) {
            Some(Value::Object(mut map)) => {
                if let Some(field) = &config.key {
                    map.remove(field);
                }
                Ok(map)
            }
            _ => Err(Error::ExpectedObject),
        }
    }

    fn set_collection(&self, key: Option<String>, items: Vec<Value>) -> BoxFuture<'static, Result<Record>> {
        let key = match key {
            Some(key) => key,
            None => return fail(Error::invalid("a key is required to store a collection")),
        };

        let (child, endpoint) = match self.generate_child(&key, None) {
            Ok(generated) => generated,
            Err(e) => return fail(e),
        };
        if let Some(endpoint) = endpoint {
            if let Err(e) = child.bind_uri(Some(endpoint)) {
                return fail(e);
            }
        }

        let loading = child.batch(super::BatchKind::Set, items, true, None);
        let store = self.clone();

        Box::pin(async move {
            loading.await?;
            store.record(key.as_str()).ok_or(Error::StoreNotFound(store.id))
        })
    }

    /// Delete a record by key or position.
    ///
    /// Child stores held by the record are torn down. With `reindex` the key
    /// map is rebuilt afterwards. With `sync` the change is applied locally
    /// only.
    pub fn del(&self, selector: impl Into<Selector>, reindex: bool, sync: bool) -> BoxFuture<'static, Result<Record>> {
        let selector = selector.into();
        let resolved = self.engine.read(self.id, |s| {
            let key = match &selector {
                Selector::Key(k) => s.index.get(k).map(|r| r.key.clone()),
                Selector::Index(i) => s.index.at(*i).map(|r| r.key.clone()),
                _ => None,
            };
            (key, s.config.clone())
        });

        let (key, config) = match resolved {
            Ok((Some(key), config)) => (key, config),
            Ok((None, _)) => return fail(Error::invalid(format!("no record for {:?}", selector))),
            Err(e) => return fail(e),
        };

        let target = match &config.uri {
            Some(endpoint) if !sync && config.callback.is_none() => Some(uri::join(endpoint, &key)),
            _ => None,
        };

        if let Some(target) = &target {
            if self.engine.client().allows(target, Verb::Delete) == Some(false) {
                tracing::warn!(store = %self.id, uri = %target, "Delete denied by cached permission");
                self.notify(
                    Event::FailedDataDelete,
                    json!({"key": key, "error": Error::ServerInvalidMethod.to_string()}),
                );
                return fail(Error::ServerInvalidMethod);
            }
        }

        let guard = match target.as_ref().map(|_| self.guard(&key)).transpose() {
            Ok(guard) => guard,
            Err(e) => return fail(e),
        };

        self.notify(Event::BeforeDataDelete, json!({"key": key, "reindex": reindex}));

        let store = self.clone();
        let options = RequestOptions::from(&config);

        Box::pin(async move {
            let _guard = guard;

            if let Some(target) = target {
                if let Err(e) = store.engine.client().delete(&target, &options).await {
                    tracing::warn!(store = %store.id, key = %key, error = %e, "Delete failed");
                    store.notify(Event::FailedDataDelete, json!({"key": key, "error": e.to_string()}));
                    return Err(e);
                }
            }

            let removed = store.engine.write(store.id, |s| {
                let removed = s.index.remove(&key);
                s.invalidate();
                if reindex {
                    s.index.reindex(s.config.key.is_none());
                }
                removed
            })?;

            let record = removed.ok_or_else(|| Error::invalid(format!("record '{}' vanished", key)))?;
            store.release_children(record.child_stores());

            tracing::debug!(store = %store.id, key = %key, "Deleted record");
            store.notify(Event::AfterDataDelete, record.to_event());
            Ok(record)
        })
    }
}
