//! Endpoint binding: sync, expiry and child generation.

use super::{fail, Engine, EngineInner, Store};
use crate::client::RequestOptions;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::events::{Event, Handler};
use crate::value::extract;
use crate::{uri, Record};
use futures::future::{ready, BoxFuture};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

impl Store {
    /// Replace the store contents with the collection at its endpoint.
    ///
    /// In callback mode the endpoint is fetched through JSONP. The payload
    /// (after `source`) may be an array of records, an object whose first
    /// array field holds them, or a single record. Any failure leaves the
    /// store empty.
    pub fn sync(&self, reindex: bool) -> BoxFuture<'static, Result<Vec<Record>>> {
        let config = match self.config() {
            Ok(config) => config,
            Err(e) => return fail(e),
        };
        let endpoint = match config.uri.clone().filter(|u| !u.is_empty()) {
            Some(endpoint) => endpoint,
            None => return fail(Error::invalid("sync requires an endpoint")),
        };

        self.notify(Event::BeforeDataSync, json!({"uri": endpoint}));

        let client = self.engine.client();
        let fetching = match &config.callback {
            Some(callback) => client.jsonp(&endpoint, callback),
            None => client.get(&endpoint, &RequestOptions::from(&config)),
        };
        let store = self.clone();

        Box::pin(async move {
            let loaded: Result<Vec<Record>> = async {
                let body = fetching.await?;
                let items = normalize(body, config.source.as_deref())?;
                store.batch(super::BatchKind::Set, items, true, None).await
            }
            .await;

            match loaded {
                Ok(records) => {
                    if reindex {
                        store.reindex()?;
                    }
                    tracing::debug!(store = %store.id, uri = %endpoint, total = records.len(), "Synced store");
                    store.notify(
                        Event::AfterDataSync,
                        json!({"uri": endpoint, "total": records.len()}),
                    );
                    Ok(records)
                }
                Err(e) => {
                    let _ = store.clear(true);
                    tracing::warn!(store = %store.id, uri = %endpoint, error = %e, "Sync failed");
                    store.notify(
                        Event::FailedDataSync,
                        json!({"uri": endpoint, "error": e.to_string()}),
                    );
                    Err(e)
                }
            }
        })
    }

    /// Bind the store to an endpoint and sync from it.
    ///
    /// Setting the current, already bound endpoint does nothing. `None`
    /// unbinds the store without touching its records.
    pub fn set_uri(&self, uri: Option<String>) -> BoxFuture<'static, Result<()>> {
        if uri.as_deref() == Some("") {
            return fail(Error::invalid("endpoint must not be empty"));
        }

        let changed = match self.bind_uri(uri.clone()) {
            Ok(changed) => changed,
            Err(e) => return fail(e),
        };

        match (changed, uri) {
            (true, Some(uri)) => {
                self.engine.cache().expire(&uri, true);
                let syncing = self.sync(true);
                Box::pin(async move { syncing.await.map(|_| ()) })
            }
            _ => Box::pin(ready(Ok(()))),
        }
    }

    /// Point the store at an endpoint and subscribe to its expiry, without
    /// fetching. Returns whether anything changed.
    pub(crate) fn bind_uri(&self, uri: Option<String>) -> Result<bool> {
        let previous = self.engine.write(self.id, |s| {
            if s.config.uri == uri && s.subscription == uri {
                return None;
            }
            let previous = s.subscription.take();
            s.config.uri = uri.clone();
            s.subscription = uri.clone();
            s.invalidate();
            Some(previous)
        })?;

        let previous = match previous {
            Some(previous) => previous,
            None => return Ok(false),
        };

        let subscription = self.subscription_id();
        if let Some(old) = previous {
            self.engine.bus().remove(&old, Some(&subscription));
        }
        if let Some(uri) = uri {
            tracing::debug!(store = %self.id, uri = %uri, "Bound store");
            self.engine
                .bus()
                .on(&uri, Event::Expire.as_str(), self.resync_handler(), &subscription);
        }
        Ok(true)
    }

    fn resync_handler(&self) -> Handler {
        let engine = Arc::downgrade(&self.engine.inner);
        let id = self.id;

        Arc::new(move |_: &Value| {
            let store = match upgrade(&engine).and_then(|engine| engine.store(id)) {
                Some(store) => store,
                None => return,
            };
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        if let Err(e) = store.sync(true).await {
                            tracing::warn!(store = %store.id, error = %e, "Re-sync after expiry failed");
                        }
                    });
                }
                Err(_) => tracing::warn!(store = %id, "Endpoint expired outside a runtime; re-sync skipped"),
            }
        })
    }

    /// Expire the endpoint periodically, which re-syncs every bound store.
    ///
    /// Requires an endpoint and a period of at least the engine's minimum
    /// expiry. `None` stops the timer. Must be called inside a tokio runtime.
    pub fn set_expires(&self, period: Option<Duration>) -> Result<()> {
        let endpoint = self.uri();

        if let Some(period) = period {
            if endpoint.is_none() {
                return Err(Error::invalid("expiry requires an endpoint"));
            }
            if period < self.engine.config().min_expiry {
                return Err(Error::invalid(format!(
                    "expiry must be at least {}ms",
                    self.engine.config().min_expiry.as_millis()
                )));
            }
        }

        let previous = self.engine.write(self.id, |s| {
            s.config.expires = period;
            s.timer.take()
        })?;
        if let Some(timer) = previous {
            timer.abort();
        }

        let period = match period {
            Some(period) => period,
            None => return Ok(()),
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::invalid("expiry timers need a tokio runtime"))?;

        let engine = Arc::downgrade(&self.engine.inner);
        let id = self.id;
        let timer = runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let store = match upgrade(&engine).and_then(|engine| engine.store(id)) {
                    Some(store) => store,
                    None => break,
                };
                let endpoint = match store.uri() {
                    Some(endpoint) => endpoint,
                    None => break,
                };
                if !store.engine.cache().expire(&endpoint, false) {
                    let bus = store.engine.bus();
                    let payload = Value::String(endpoint.clone());
                    for event in [Event::BeforeExpire, Event::Expire, Event::AfterExpire] {
                        bus.fire(&endpoint, event.as_str(), &payload);
                    }
                }
            }
        });

        tracing::debug!(store = %self.id, period_ms = period.as_millis() as u64, "Started expiry timer");
        self.engine.write(self.id, |s| s.timer = Some(timer))
    }

    /// Replace the record at `key` with a fresh child store.
    ///
    /// The child inherits the parent's request and crawl settings. Unless
    /// `key` is a leaf, it is bound to `uri` or, by default, to the parent
    /// endpoint joined with `key`, and synced.
    pub fn generate(&self, key: &str, uri: Option<String>) -> BoxFuture<'static, Result<Store>> {
        let (child, endpoint) = match self.generate_child(key, uri) {
            Ok(generated) => generated,
            Err(e) => return fail(e),
        };

        match endpoint {
            Some(endpoint) => {
                let binding = child.set_uri(Some(endpoint));
                Box::pin(async move {
                    binding.await?;
                    Ok(child)
                })
            }
            None => Box::pin(ready(Ok(child))),
        }
    }

    /// Create the child for `generate` and return it with its endpoint.
    pub(crate) fn generate_child(&self, key: &str, uri: Option<String>) -> Result<(Store, Option<String>)> {
        if key.is_empty() {
            return Err(Error::invalid("a key is required to generate a store"));
        }
        if let Some(endpoint) = &uri {
            let endpoint = endpoint.trim_end_matches('/');
            if self.lineage_endpoints().iter().any(|e| e == endpoint) {
                return Err(Error::invalid(format!(
                    "'{}' is already bound by an enclosing store",
                    endpoint
                )));
            }
        }

        let (config, name, previous) = self.engine.write(self.id, |s| {
            let previous = match s.index.get_mut(key) {
                Some(record) => {
                    let previous = record.child_stores();
                    record.data.clear();
                    record.nested = None;
                    previous
                }
                None => {
                    s.index.upsert(Record::empty(key));
                    Vec::new()
                }
            };
            if !s.collections.iter().any(|c| c == key) {
                s.collections.push(key.to_string());
            }
            s.invalidate();
            (s.config.clone(), s.name.clone(), previous)
        })?;
        self.release_children(previous);

        let child = self.engine.create_child(
            self.id,
            format!("{}-{}", name, key),
            StoreConfig {
                recursive: config.recursive,
                retrieve: config.retrieve,
                ..config.inherit(key)
            },
        );
        self.engine.write(self.id, |s| {
            if let Some(record) = s.index.get_mut(key) {
                record.nested = Some(child.id);
            }
        })?;

        let endpoint = uri.or_else(|| match &config.uri {
            Some(base) if !config.is_leaf(key) => Some(uri::join(base, key)),
            _ => None,
        });
        Ok((child, endpoint))
    }

    /// Release everything the store holds.
    ///
    /// Expires its endpoint and record endpoints, drops its subscription
    /// and timer, and tears down child stores. The store itself stays
    /// usable.
    pub fn teardown(&self) {
        let taken = self.engine.write(self.id, |s| {
            s.config.expires = None;
            let keys: Vec<String> = s.index.records().iter().map(|r| r.key.clone()).collect();
            (s.config.uri.clone(), keys, s.timer.take(), s.subscription.take())
        });
        let (endpoint, keys, timer, subscription) = match taken {
            Ok(taken) => taken,
            Err(_) => return,
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(subscribed) = subscription {
            self.engine.bus().remove(&subscribed, Some(&self.subscription_id()));
        }
        if let Some(endpoint) = &endpoint {
            let cache = self.engine.cache();
            cache.expire(endpoint, true);
            for key in &keys {
                cache.expire(&uri::join(endpoint, key), true);
            }
        }

        let _ = self.clear(true);
        tracing::debug!(store = %self.id, "Tore down store");
        self.notify(Event::AfterDataTeardown, Value::Null);
    }
}

fn upgrade(engine: &Weak<EngineInner>) -> Option<Engine> {
    engine.upgrade().map(|inner| Engine { inner })
}

/// Turn a sync payload into batch items.
fn normalize(body: Option<Value>, source: Option<&str>) -> Result<Vec<Value>> {
    let body = body
        .and_then(|body| extract(body, source))
        .ok_or(Error::ExpectedObject)?;

    match body {
        Value::Array(items) => Ok(items),
        Value::Object(map) => {
            let nested = map.values().find_map(|v| match v {
                Value::Array(items) => Some(items.clone()),
                _ => None,
            });
            Ok(nested.unwrap_or_else(|| vec![Value::Object(map)]))
        }
        _ => Err(Error::ExpectedObject),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpResponse, MockBackend, Verb};
    use crate::BatchKind;
    use parking_lot::Mutex;

    const USERS: &str = "https://api.test/users";

    fn engine(backend: &MockBackend) -> Engine {
        Engine::new(backend.clone())
    }

    #[test]
    fn normalize_shapes() {
        assert_eq!(normalize(Some(json!([{"a": 1}])), None).unwrap(), vec![json!({"a": 1})]);
        assert_eq!(
            normalize(Some(json!({"total": 1, "rows": [{"a": 1}]})), None).unwrap(),
            vec![json!({"a": 1})]
        );
        assert_eq!(normalize(Some(json!({"a": 1})), None).unwrap(), vec![json!({"a": 1})]);
        assert_eq!(
            normalize(Some(json!({"data": {"items": [{"a": 1}]}})), Some("data.items")).unwrap(),
            vec![json!({"a": 1})]
        );
        assert_eq!(normalize(Some(json!(3)), None), Err(Error::ExpectedObject));
        assert_eq!(normalize(None, None), Err(Error::ExpectedObject));
    }

    #[tokio::test]
    async fn sync_replaces_records() {
        let backend = MockBackend::new();
        backend.get(USERS, json!([{"id": 1, "name": "Ann"}, {"id": 2, "name": "Bob"}]));
        let store = engine(&backend).create("users", StoreConfig::new().with_key("id").with_uri(USERS));
        store.set(Some("old"), json!({"name": "Old"}), true).await.unwrap();

        let records = store.sync(false).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(store.record("old").is_none());
        assert_eq!(store.record("2").unwrap().to_json(), json!({"name": "Bob"}));
        assert!(store.loaded());
    }

    #[tokio::test]
    async fn sync_failure_clears_and_notifies() {
        let backend = MockBackend::new();
        backend.on(Verb::Get, USERS, HttpResponse::status(500));
        let store = engine(&backend).create("users", StoreConfig::new().with_uri(USERS));
        store.set(Some("a"), json!({"v": 1}), true).await.unwrap();

        let failed = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&failed);
        store.engine().bus().on(
            "users",
            Event::FailedDataSync.as_str(),
            Arc::new(move |payload| f.lock().push(payload.clone())),
            "test",
        );

        assert_eq!(store.sync(true).await.unwrap_err(), Error::ServerError(500));
        assert_eq!(store.total(), 0);
        assert_eq!(failed.lock().len(), 1);
        assert_eq!(failed.lock()[0]["uri"], json!(USERS));
    }

    #[tokio::test]
    async fn sync_without_endpoint_is_invalid() {
        let store = engine(&MockBackend::new()).create("users", StoreConfig::new());
        assert!(matches!(store.sync(false).await, Err(Error::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn sync_uses_callback_mode() {
        let backend = MockBackend::new();
        backend.get(&format!("{}?callback=cb", USERS), json!([{"id": "a"}]));
        let store = engine(&backend).create(
            "users",
            StoreConfig::new().with_key("id").with_uri(USERS).with_callback("cb"),
        );

        store.sync(false).await.unwrap();
        assert_eq!(store.keys(), vec!["a"]);
    }

    #[tokio::test]
    async fn set_uri_binds_and_syncs_once() {
        let backend = MockBackend::new();
        backend.get(USERS, json!([{"id": 1}]));
        let store = engine(&backend).create("users", StoreConfig::new().with_key("id"));

        store.set_uri(Some(USERS.into())).await.unwrap();
        store.set_uri(Some(USERS.into())).await.unwrap();

        assert_eq!(store.uri().as_deref(), Some(USERS));
        assert_eq!(store.total(), 1);
        assert_eq!(backend.count(Verb::Get, USERS), 1);

        let err = store.set_uri(Some(String::new())).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn expiry_notification_resyncs() {
        let backend = MockBackend::new();
        backend.get(USERS, json!([{"id": 1}]));
        let store = engine(&backend).create("users", StoreConfig::new().with_key("id"));
        store.set_uri(Some(USERS.into())).await.unwrap();

        backend.get(USERS, json!([{"id": 1}, {"id": 2}]));
        store.engine().cache().expire(USERS, false);

        for _ in 0..50 {
            if store.total() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.total(), 2);
    }

    #[tokio::test]
    async fn set_expires_validates() {
        let store = engine(&MockBackend::new()).create("users", StoreConfig::new());
        assert!(store.set_expires(Some(Duration::from_secs(5))).is_err());

        store.update_config(|c| c.uri = Some(USERS.into())).unwrap();
        assert!(store.set_expires(Some(Duration::from_millis(10))).is_err());
        assert!(store.set_expires(Some(Duration::from_secs(5))).is_ok());
        assert_eq!(store.config().unwrap().expires, Some(Duration::from_secs(5)));

        store.set_expires(None).unwrap();
        assert_eq!(store.config().unwrap().expires, None);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_timer_fires_expire_events() {
        let store = engine(&MockBackend::new()).create("users", StoreConfig::new());
        store.update_config(|c| c.uri = Some(USERS.into())).unwrap();

        let fired = Arc::new(Mutex::new(Vec::new()));
        for event in [Event::BeforeExpire, Event::Expire, Event::AfterExpire] {
            let f = Arc::clone(&fired);
            store
                .engine()
                .bus()
                .on(USERS, event.as_str(), Arc::new(move |_| f.lock().push(event)), "test");
        }

        store.set_expires(Some(Duration::from_secs(2))).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(fired.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(*fired.lock(), vec![Event::BeforeExpire, Event::Expire, Event::AfterExpire]);
    }

    #[tokio::test]
    async fn generate_binds_child_to_derived_endpoint() {
        let backend = MockBackend::new();
        backend.get(&format!("{}/1", USERS), json!([{"id": "p1"}, {"id": "p2"}]));
        let store = engine(&backend).create("users", StoreConfig::new().with_key("id").with_uri(USERS));
        store.set(Some("1"), json!({"name": "Ann"}), true).await.unwrap();

        let child = store.generate("1", None).await.unwrap();
        assert_eq!(child.name().unwrap(), "users-1");
        assert_eq!(child.uri().as_deref(), Some("https://api.test/users/1"));
        assert_eq!(child.total(), 2);

        let record = store.record("1").unwrap();
        assert_eq!(record.nested, Some(child.id()));
        assert!(record.data.is_empty());
    }

    #[tokio::test]
    async fn generate_replaces_previous_child() {
        let store = engine(&MockBackend::new()).create("lists", StoreConfig::new());

        let first = store.generate("a", None).await.unwrap();
        let second = store.generate("a", None).await.unwrap();

        assert!(!first.is_alive());
        assert!(second.is_alive());
        assert_eq!(store.total(), 1);
        assert_eq!(store.collections(), vec!["a"]);
    }

    #[tokio::test]
    async fn generate_rejects_enclosing_endpoint() {
        let backend = MockBackend::new();
        backend.get(&format!("{}/a", USERS), json!([{"id": "x"}]));
        let store = engine(&backend).create("users", StoreConfig::new().with_key("id").with_uri(USERS));
        let child = store.generate("a", Some(format!("{}/a", USERS))).await.unwrap();

        let err = child.generate("b", Some(format!("{}/", USERS))).await;
        assert!(matches!(err, Err(Error::InvalidArguments(_))));
        assert!(child.record("b").is_none());
        assert_eq!(store.engine().len(), 2);
    }

    #[tokio::test]
    async fn teardown_releases_descendants() {
        let backend = MockBackend::new();
        let store = engine(&backend).create("root", StoreConfig::new());
        let child = store.generate("a", None).await.unwrap();
        let grandchild = child.generate("b", None).await.unwrap();
        store
            .batch(BatchKind::Set, vec![json!({"v": 1})], false, None)
            .await
            .unwrap();

        let torn = Arc::new(Mutex::new(0));
        let t = Arc::clone(&torn);
        store.engine().bus().on(
            "root",
            Event::AfterDataTeardown.as_str(),
            Arc::new(move |_| *t.lock() += 1),
            "test",
        );

        store.teardown();
        assert!(!child.is_alive());
        assert!(!grandchild.is_alive());
        assert_eq!(store.total(), 0);
        assert!(store.is_alive());
        assert_eq!(*torn.lock(), 1);
    }
}
