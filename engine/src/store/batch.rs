//! Batch processor: multi-record set and delete.

use super::{fail, Selector, Store};
use crate::client::RequestOptions;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::settle::Deferred;
use crate::value::{extract, key_text};
use crate::{uri, Record};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Batch operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Set,
    Delete,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Set => "set",
            BatchKind::Delete => "del",
        }
    }
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "set" => Ok(BatchKind::Set),
            "del" | "delete" => Ok(BatchKind::Delete),
            other => Err(Error::invalid(format!("unknown batch type '{}'", other))),
        }
    }
}

impl Store {
    /// Set or delete many records.
    ///
    /// Set items may be objects, arrays (stored as generated child stores)
    /// or resource references that are fetched first. Delete items are keys
    /// or positions. Items run concurrently, `chunk` at a time being
    /// submitted; the first failing item rejects the batch while the rest
    /// still settle and keep their effects.
    ///
    /// With `sync` the store is cleared first and every change is applied
    /// locally only; this is how a sync replaces the collection.
    ///
    /// Resolves to the records held afterwards.
    pub fn batch(
        &self,
        kind: BatchKind,
        items: Vec<Value>,
        sync: bool,
        chunk: Option<usize>,
    ) -> BoxFuture<'static, Result<Vec<Record>>> {
        if sync && kind == BatchKind::Delete {
            return fail(Error::invalid("sync batches only support set"));
        }
        let chunk = chunk.unwrap_or(self.engine.config().chunk_size);
        if chunk == 0 {
            return fail(Error::invalid("chunk size must be positive"));
        }
        let config = match self.config() {
            Ok(config) => config,
            Err(e) => return fail(e),
        };

        self.notify(
            Event::BeforeDataBatch,
            json!({"type": kind.as_str(), "items": items.len()}),
        );

        if sync {
            if let Err(e) = self.clear(true) {
                return fail(e);
            }
        }

        let outcome: Deferred<()> = Deferred::new();
        {
            let store = self.clone();
            outcome.then(move |result| {
                if let Err(e) = result {
                    tracing::warn!(store = %store.id, error = %e, "Batch failed");
                    store.notify(Event::FailedDataBatch, json!({"error": e.to_string()}));
                }
            });
        }

        let store = self.clone();
        Box::pin(async move {
            let total = items.len();
            let mut running: FuturesUnordered<BoxFuture<'static, Result<()>>> = FuturesUnordered::new();

            match kind {
                BatchKind::Set => {
                    let mut items = items.into_iter().enumerate().peekable();
                    while items.peek().is_some() {
                        for (position, item) in items.by_ref().take(chunk) {
                            running.push(store.batch_set(item, position, sync, &config));
                        }
                        tokio::task::yield_now().await;
                    }
                }
                BatchKind::Delete => {
                    for selector in store.deletion_order(items) {
                        let deleting = store.del(selector, false, sync);
                        running.push(Box::pin(async move { deleting.await.map(|_| ()) }));
                    }
                }
            }

            while let Some(result) = running.next().await {
                if let Err(e) = result {
                    outcome.reject(e);
                }
            }

            if let Some(Err(e)) = outcome.peek() {
                return Err(e);
            }

            let records = store.engine.write(store.id, |s| {
                if kind == BatchKind::Delete {
                    s.invalidate();
                    s.index.reindex(s.config.key.is_none());
                }
                s.loaded = true;
                s.index.records().to_vec()
            })?;
            outcome.resolve(());

            tracing::debug!(store = %store.id, kind = %kind, items = total, "Batch complete");
            store.notify(
                Event::AfterDataBatch,
                json!({"type": kind.as_str(), "items": total, "total": records.len()}),
            );
            Ok(records)
        })
    }

    fn batch_set(&self, item: Value, position: usize, sync: bool, config: &StoreConfig) -> BoxFuture<'static, Result<()>> {
        match item {
            Value::Object(map) => {
                let key = config
                    .key
                    .as_ref()
                    .and_then(|field| map.get(field))
                    .map(key_text)
                    .unwrap_or_else(|| position.to_string());
                let setting = self.set(Some(key.as_str()), Value::Object(map), sync);
                Box::pin(async move { setting.await.map(|_| ()) })
            }
            Value::Array(items) => {
                let key = position.to_string();
                if config.uri.is_some() {
                    let generating = self.generate(&key, None);
                    Box::pin(async move { generating.await.map(|_| ()) })
                } else {
                    let setting = self.set(Some(key.as_str()), Value::Array(items), sync);
                    Box::pin(async move { setting.await.map(|_| ()) })
                }
            }
            Value::String(reference) => self.batch_fetch(&reference, sync, config),
            _ => fail(Error::invalid("batch items must be objects, arrays or references")),
        }
    }

    /// Fetch a referenced record and set it under the reference's last segment.
    fn batch_fetch(&self, reference: &str, sync: bool, config: &StoreConfig) -> BoxFuture<'static, Result<()>> {
        let target = match &config.uri {
            Some(base) => uri::resolve(base, reference),
            None => reference.to_string(),
        };
        let key = uri::last_segment(&target).to_string();
        if key.is_empty() {
            tracing::debug!(store = %self.id, uri = %target, "Skipped reference without key");
            return Box::pin(futures::future::ready(Ok(())));
        }

        let fetching = self.engine.client().get(&target, &RequestOptions::from(config));
        let source = config.source.clone();
        let key_field = config.key.clone();
        let store = self.clone();

        Box::pin(async move {
            let payload = fetching
                .await?
                .and_then(|body| extract(body, source.as_deref()))
                .ok_or(Error::ExpectedObject)?;
            let key = match (&key_field, &payload) {
                (Some(field), Value::Object(map)) => map.get(field).map(key_text).unwrap_or(key),
                _ => key,
            };
            store.set(Some(key.as_str()), payload, sync).await.map(|_| ())
        })
    }

    /// Selectors for a batch delete, highest position first.
    fn deletion_order(&self, items: Vec<Value>) -> Vec<Selector> {
        let mut selectors: Vec<(Option<usize>, Selector)> = self
            .engine
            .read(self.id, |s| {
                items
                    .into_iter()
                    .map(|item| {
                        let selector = match item {
                            Value::String(key) => Selector::Key(key),
                            Value::Number(n) => match n.as_u64() {
                                Some(i) => Selector::Index(i as usize),
                                None => Selector::Key(n.to_string()),
                            },
                            other => Selector::Key(other.to_string()),
                        };
                        let position = match &selector {
                            Selector::Key(k) => s.index.position(k),
                            Selector::Index(i) => Some(*i),
                            _ => None,
                        };
                        (position, selector)
                    })
                    .collect()
            })
            .unwrap_or_default();

        selectors.sort_by(|a, b| b.0.cmp(&a.0));
        selectors.into_iter().map(|(_, selector)| selector).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpResponse, MockBackend, Verb};
    use crate::Engine;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn keyed(backend: MockBackend) -> Store {
        Engine::new(backend).create("items", StoreConfig::new().with_key("id"))
    }

    #[test]
    fn parse_kind() {
        assert_eq!("SET".parse::<BatchKind>().unwrap(), BatchKind::Set);
        assert_eq!("del".parse::<BatchKind>().unwrap(), BatchKind::Delete);
        assert!("merge".parse::<BatchKind>().is_err());
    }

    #[tokio::test]
    async fn sync_set_replaces_contents() {
        let store = keyed(MockBackend::new());
        store.set(Some("old"), json!({"v": "z"}), false).await.unwrap();

        store
            .batch(
                BatchKind::Set,
                vec![json!({"id": 1, "v": "a"}), json!({"id": 2, "v": "b"})],
                true,
                None,
            )
            .await
            .unwrap();

        assert_eq!(store.total(), 2);
        assert!(store.loaded());
        assert_eq!(store.record("1").unwrap().to_json(), json!({"v": "a"}));
        assert!(store.record("old").is_none());
    }

    #[tokio::test]
    async fn rejects_bad_arguments() {
        let store = keyed(MockBackend::new());

        let err = store.batch(BatchKind::Delete, vec![json!("a")], true, None).await;
        assert!(matches!(err, Err(Error::InvalidArguments(_))));

        let err = store.batch(BatchKind::Set, vec![json!({})], false, Some(0)).await;
        assert!(matches!(err, Err(Error::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn empty_batch_marks_loaded() {
        let store = keyed(MockBackend::new());
        let records = store.batch(BatchKind::Set, Vec::new(), false, None).await.unwrap();
        assert!(records.is_empty());
        assert!(store.loaded());
    }

    #[tokio::test]
    async fn small_chunks_keep_submission_order() {
        let store = Engine::new(MockBackend::new()).create("list", StoreConfig::new());
        let items = (0..7).map(|i| json!({"n": i})).collect();

        store.batch(BatchKind::Set, items, false, Some(3)).await.unwrap();
        assert_eq!(store.keys(), vec!["0", "1", "2", "3", "4", "5", "6"]);
        assert_eq!(store.record("4").unwrap().to_json(), json!({"n": 4}));
    }

    #[tokio::test]
    async fn delete_reduces_total() {
        let store = keyed(MockBackend::new());
        let items = (0..5).map(|i| json!({"id": i})).collect();
        store.batch(BatchKind::Set, items, false, None).await.unwrap();

        store
            .batch(BatchKind::Delete, vec![json!("1"), json!(0), json!("3")], false, None)
            .await
            .unwrap();

        assert_eq!(store.total(), 2);
        assert_eq!(store.keys(), vec!["2", "4"]);
    }

    #[tokio::test]
    async fn references_are_fetched() {
        let backend = MockBackend::new();
        backend.get("https://api.test/items/a", json!({"v": 1}));
        backend.get("https://api.test/b", json!({"id": "bee", "v": 2}));
        let store = keyed(backend);
        store.update_config(|c| c.uri = Some("https://api.test/items".into())).unwrap();

        store
            .batch(
                BatchKind::Set,
                vec![json!("a"), json!("/b"), json!("https://api.test/")],
                true,
                None,
            )
            .await
            .unwrap();

        assert_eq!(store.total(), 2);
        assert_eq!(store.record("a").unwrap().to_json(), json!({"v": 1}));
        assert_eq!(store.record("bee").unwrap().to_json(), json!({"v": 2}));
    }

    #[tokio::test]
    async fn first_failure_wins() {
        let backend = MockBackend::new();
        backend.on(Verb::Get, "/items/bad", HttpResponse::status(500));
        backend.fail(Verb::Get, "/items/worse", "reset");
        backend.get("/items/good", json!({"v": 1}));
        let store = Engine::new(backend.clone()).create("items", StoreConfig::new().with_uri("/items"));

        let failures = Arc::new(Mutex::new(0));
        let f = Arc::clone(&failures);
        store.engine().bus().on(
            "items",
            "failedDataBatch",
            Arc::new(move |_| *f.lock() += 1),
            "test",
        );

        let result = store
            .batch(
                BatchKind::Set,
                vec![json!("bad"), json!("good"), json!("worse")],
                true,
                None,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(*failures.lock(), 1);
        // Successful items keep their effect
        assert!(store.record("good").is_some());
        assert!(!store.loaded());
    }
}
