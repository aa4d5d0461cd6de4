//! Relation crawler.
//!
//! Turns record fields that hold resource references, or lists of records or
//! references, into child stores.

use super::{fail, Selector, Store};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::{uri, Field, Record};
use futures::future::{join_all, BoxFuture};
use serde_json::{json, Value};

enum Relation {
    /// Records or references loaded through a batch
    Many(Vec<Value>),
    /// A single endpoint the child binds to
    One(String),
}

impl Store {
    /// Materialize child stores for a record's relation fields.
    ///
    /// Ignored and leaf fields are skipped, as are fields already holding a
    /// child store, so crawling twice is harmless. References are resolved
    /// against the record's endpoint. Child failures are announced on the
    /// child and logged; they do not fail the crawl.
    ///
    /// Resolves to the record with its relation fields replaced by stores.
    pub fn crawl(&self, selector: impl Into<Selector>) -> BoxFuture<'static, Result<Record>> {
        let selector = selector.into();
        let found = self.engine.write(self.id, |s| {
            let record = match &selector {
                Selector::Key(k) => s.index.get(k),
                Selector::Index(i) => s.index.at(*i),
                _ => None,
            }
            .cloned();
            if record.is_some() {
                s.crawled = true;
            }
            (record, s.config.clone())
        });

        let (record, config) = match found {
            Ok((Some(record), config)) => (record, config),
            Ok((None, _)) => return fail(Error::invalid(format!("no record for {:?}", selector))),
            Err(e) => return fail(e),
        };

        let base = config.uri.as_deref().map(|u| uri::join(u, &record.key));
        let resolve = |reference: &str| match &base {
            Some(base) => uri::resolve(base, reference),
            None => reference.to_string(),
        };
        let lineage = self.lineage_endpoints();
        let mut loads = Vec::new();

        for (field, value) in &record.data {
            if config.skips(field) {
                continue;
            }

            let relation = match value {
                Field::Sequence(items) if !items.is_empty() => Relation::Many(items.clone()),
                Field::Primitive(Value::String(s)) if uri::is_reference(s) => Relation::One(s.clone()),
                _ => continue,
            };

            let aliased = match &relation {
                Relation::Many(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| resolve(s))
                    .find(|target| lineage.contains(&normalized(target))),
                Relation::One(reference) => {
                    Some(resolve(reference)).filter(|target| lineage.contains(&normalized(target)))
                }
            };
            if let Some(target) = aliased {
                let e = Error::invalid(format!("'{}' refers back to an enclosing store", target));
                tracing::warn!(store = %self.id, key = %record.key, field = %field, error = %e, "Relation not crawled");
                self.notify(
                    Event::FailedDataRetrieve,
                    json!({"key": record.key, "field": field, "error": e.to_string()}),
                );
                continue;
            }

            let child = self.engine.create_child(
                self.id,
                format!("{}-{}", record.key, field),
                config.inherit(field),
            );

            let attached = self.engine.write(self.id, |s| {
                let attached = match s.index.get_mut(&record.key) {
                    Some(current) => {
                        current.data.insert(field.clone(), Field::Store(child.id()));
                        true
                    }
                    None => false,
                };
                if attached && !s.collections.contains(field) {
                    s.collections.push(field.clone());
                }
                s.invalidate();
                attached
            });
            if !matches!(attached, Ok(true)) {
                self.engine.release(child.id());
                continue;
            }

            let loading: BoxFuture<'static, Result<()>> = match relation {
                Relation::Many(items) => {
                    let items = items
                        .into_iter()
                        .map(|item| match item {
                            Value::String(s) => Value::String(resolve(&s)),
                            other => other,
                        })
                        .collect();
                    let batch = child.batch(super::BatchKind::Set, items, true, None);
                    Box::pin(async move { batch.await.map(|_| ()) })
                }
                Relation::One(reference) => child.set_uri(Some(resolve(&reference))),
            };

            tracing::debug!(store = %self.id, key = %record.key, field = %field, child = %child.id(), "Crawled relation");
            loads.push((field.clone(), child, loading));
        }

        let store = self.clone();
        let key = record.key;

        Box::pin(async move {
            let settled = join_all(
                loads
                    .into_iter()
                    .map(|(field, child, loading)| async move { (field, child, loading.await) }),
            )
            .await;

            for (field, child, result) in settled {
                match result {
                    Ok(()) => child.notify(
                        Event::AfterDataRetrieve,
                        json!({"key": key, "field": field, "total": child.total()}),
                    ),
                    Err(e) => {
                        tracing::warn!(store = %store.id, key = %key, field = %field, error = %e, "Relation retrieval failed");
                        child.notify(
                            Event::FailedDataRetrieve,
                            json!({"key": key, "field": field, "error": e.to_string()}),
                        );
                    }
                }
            }

            store
                .record(key.as_str())
                .ok_or_else(|| Error::invalid(format!("record '{}' vanished", key)))
        })
    }

    /// Endpoints bound by this store and each of its ancestors.
    pub(crate) fn lineage_endpoints(&self) -> Vec<String> {
        let mut endpoints = Vec::new();
        let mut current = Some(self.id);
        while let Some(id) = current {
            match self.engine.read(id, |s| (s.config.uri.clone(), s.parent)) {
                Ok((endpoint, parent)) => {
                    endpoints.extend(endpoint.as_deref().map(normalized));
                    current = parent;
                }
                Err(_) => break,
            }
        }
        endpoints
    }
}

fn normalized(endpoint: &str) -> String {
    endpoint.trim_end_matches('/').to_string()
}
