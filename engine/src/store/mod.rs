//! Store - the record container and its REST binding.
//!
//! Stores live in an [`Engine`] arena and are addressed through cheap
//! [`Store`] handles. A store created by crawling or by `generate` records
//! its parent's id only; the parent record owns the child through the arena
//! and releases it when the record goes away.
//!
//! Locking discipline: the arena mutex is never held across an await point
//! or while notifications are fired.

mod batch;
mod crawl;
mod sync;
mod view;
mod write;

pub use batch::BatchKind;
pub use view::Sensitivity;

use crate::cache::{MemoryCache, UriCache};
use crate::client::Client;
use crate::config::{EngineConfig, StoreConfig};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, Observer};
use crate::index::RecordIndex;
use crate::transport::HttpBackend;
use crate::{Record, StoreId};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// State of one store inside the arena.
#[derive(Default)]
pub(crate) struct StoreState {
    /// Notification target
    pub(crate) name: String,
    /// Weak back-reference; lookup only
    pub(crate) parent: Option<StoreId>,
    pub(crate) config: StoreConfig,
    pub(crate) index: RecordIndex,
    /// Cached sorted views, as record positions
    pub(crate) views: HashMap<String, Vec<usize>>,
    /// Fields that hold child stores
    pub(crate) collections: Vec<String>,
    pub(crate) crawled: bool,
    pub(crate) loaded: bool,
    /// Keys with a mutation in flight
    pub(crate) pending: HashSet<String>,
    /// Expiry timer
    pub(crate) timer: Option<JoinHandle<()>>,
    /// Endpoint carrying the expiry subscription
    pub(crate) subscription: Option<String>,
}

impl StoreState {
    fn new(name: String, parent: Option<StoreId>, config: StoreConfig) -> Self {
        Self {
            name,
            parent,
            config,
            ..Default::default()
        }
    }

    /// Reset the volatile record state, keeping configuration.
    ///
    /// Returns the child stores that were referenced by the dropped records.
    pub(crate) fn reset(&mut self) -> Vec<StoreId> {
        let children = self
            .index
            .records()
            .iter()
            .flat_map(Record::child_stores)
            .collect();

        self.index.clear();
        self.views.clear();
        self.collections.clear();
        self.crawled = false;
        self.loaded = false;
        children
    }

    /// Drop cached views.
    pub(crate) fn invalidate(&mut self) {
        self.views.clear();
    }
}

struct EngineInner {
    stores: Mutex<HashMap<StoreId, StoreState>>,
    next_id: AtomicU64,
    client: Client,
    bus: Arc<dyn EventBus>,
    config: EngineConfig,
}

/// Arena of stores plus their shared collaborators.
///
/// Cloning yields another handle to the same arena.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("stores", &self.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    backend: Arc<dyn HttpBackend>,
    bus: Option<Arc<dyn EventBus>>,
    cache: Option<Arc<dyn UriCache>>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Use a custom notification bus.
    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Use a custom URI cache.
    pub fn cache(mut self, cache: Arc<dyn UriCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use custom engine tuning.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine.
    pub fn build(self) -> Engine {
        let bus = self
            .bus
            .unwrap_or_else(|| Observer::new_shared() as Arc<dyn EventBus>);
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new(Arc::clone(&bus))) as Arc<dyn UriCache>);
        let client = Client::new(self.backend, cache, &self.config);

        Engine {
            inner: Arc::new(EngineInner {
                stores: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                client,
                bus,
                config: self.config,
            }),
        }
    }
}

impl Engine {
    /// Create an engine over a backend with the in-process bus and cache.
    pub fn new(backend: impl HttpBackend + 'static) -> Self {
        Self::builder(Arc::new(backend)).build()
    }

    /// Start building an engine over a backend.
    pub fn builder(backend: Arc<dyn HttpBackend>) -> EngineBuilder {
        EngineBuilder {
            backend,
            bus: None,
            cache: None,
            config: EngineConfig::default(),
        }
    }

    /// Create an empty store. `name` is the notification target.
    pub fn create(&self, name: impl Into<String>, config: StoreConfig) -> Store {
        self.insert(StoreState::new(name.into(), None, config))
    }

    /// Create a store and load initial records into it.
    ///
    /// With an endpoint configured the store is bound to it and synced
    /// instead.
    pub fn factory(
        &self,
        name: impl Into<String>,
        records: Option<Vec<Value>>,
        config: StoreConfig,
    ) -> BoxFuture<'static, Result<Store>> {
        let uri = config.uri.clone();
        let store = self.create(
            name,
            StoreConfig {
                uri: None,
                ..config
            },
        );

        Box::pin(async move {
            if let Some(records) = records {
                store.batch(BatchKind::Set, records, false, None).await?;
            }
            if let Some(uri) = uri {
                store.set_uri(Some(uri)).await?;
            }
            Ok(store)
        })
    }

    /// Handle to a live store.
    pub fn store(&self, id: StoreId) -> Option<Store> {
        self.contains(id).then(|| Store {
            engine: self.clone(),
            id,
        })
    }

    /// Check if a store is live.
    pub fn contains(&self, id: StoreId) -> bool {
        self.inner.stores.lock().contains_key(&id)
    }

    /// Number of live stores.
    pub fn len(&self) -> usize {
        self.inner.stores.lock().len()
    }

    /// Check if the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The HTTP client.
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// The URI cache.
    pub fn cache(&self) -> &Arc<dyn UriCache> {
        self.inner.client.cache()
    }

    /// The notification bus.
    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.inner.bus
    }

    /// Engine tuning.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn insert(&self, state: StoreState) -> Store {
        let id = StoreId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(store = %id, name = %state.name, "Created store");
        self.inner.stores.lock().insert(id, state);
        Store {
            engine: self.clone(),
            id,
        }
    }

    /// Create a store owned by a record of `parent`.
    pub(crate) fn create_child(&self, parent: StoreId, name: String, config: StoreConfig) -> Store {
        self.insert(StoreState::new(name, Some(parent), config))
    }

    /// Remove a store from the arena, cancelling its timer.
    pub(crate) fn release(&self, id: StoreId) {
        let removed = self.inner.stores.lock().remove(&id);
        if let Some(state) = removed {
            if let Some(timer) = state.timer {
                timer.abort();
            }
            tracing::debug!(store = %id, "Released store");
        }
    }

    pub(crate) fn read<R>(&self, id: StoreId, f: impl FnOnce(&StoreState) -> R) -> Result<R> {
        let stores = self.inner.stores.lock();
        stores.get(&id).map(f).ok_or(Error::StoreNotFound(id))
    }

    pub(crate) fn write<R>(&self, id: StoreId, f: impl FnOnce(&mut StoreState) -> R) -> Result<R> {
        let mut stores = self.inner.stores.lock();
        stores.get_mut(&id).map(f).ok_or(Error::StoreNotFound(id))
    }
}

/// What to read from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Every record
    All,
    /// A record by key
    Key(String),
    /// A record by position
    Index(usize),
    /// Records in `[start, start + offset)`
    Range { start: usize, offset: usize },
    /// Several selectors, resolved in order
    List(Vec<Selector>),
}

impl From<&str> for Selector {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            Selector::All
        } else if s.contains(',') {
            Selector::List(
                s.split(',')
                    .map(str::trim)
                    .map(|item| match item.parse::<usize>() {
                        Ok(i) => Selector::Index(i),
                        Err(_) => Selector::Key(item.to_string()),
                    })
                    .collect(),
            )
        } else {
            Selector::Key(s.to_string())
        }
    }
}

impl From<String> for Selector {
    fn from(s: String) -> Self {
        Selector::from(s.as_str())
    }
}

impl From<usize> for Selector {
    fn from(i: usize) -> Self {
        Selector::Index(i)
    }
}

/// Result of [`Store::get`].
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    One(Record),
    Many(Vec<Record>),
    List(Vec<Option<Record>>),
}

impl Selection {
    /// Flatten into the records found.
    pub fn into_records(self) -> Vec<Record> {
        match self {
            Selection::One(record) => vec![record],
            Selection::Many(records) => records,
            Selection::List(records) => records.into_iter().flatten().collect(),
        }
    }
}

/// Removes a key from the in-flight set when dropped.
pub(crate) struct MutationGuard {
    engine: Engine,
    id: StoreId,
    key: String,
}

impl Drop for MutationGuard {
    fn drop(&mut self) {
        let _ = self.engine.write(self.id, |state| state.pending.remove(&self.key));
    }
}

/// Handle to a store in an engine arena.
#[derive(Clone)]
pub struct Store {
    engine: Engine,
    id: StoreId,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.id)
            .field("name", &self.name().unwrap_or_default())
            .finish()
    }
}

impl PartialEq for Store {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.engine.inner, &other.engine.inner)
    }
}

impl Store {
    /// Arena id.
    pub fn id(&self) -> StoreId {
        self.id
    }

    /// Owning engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Check if the store is still in the arena.
    pub fn is_alive(&self) -> bool {
        self.engine.contains(self.id)
    }

    /// Notification target.
    pub fn name(&self) -> Result<String> {
        self.engine.read(self.id, |s| s.name.clone())
    }

    /// Store this one was created for, if any.
    pub fn parent(&self) -> Option<Store> {
        let parent = self.engine.read(self.id, |s| s.parent).ok().flatten()?;
        self.engine.store(parent)
    }

    /// Current configuration.
    pub fn config(&self) -> Result<StoreConfig> {
        self.engine.read(self.id, |s| s.config.clone())
    }

    /// Change configuration in place.
    ///
    /// Endpoint and expiry changes should go through [`Store::set_uri`] and
    /// [`Store::set_expires`], which also manage subscriptions and timers.
    pub fn update_config(&self, f: impl FnOnce(&mut StoreConfig)) -> Result<()> {
        self.engine.write(self.id, |s| {
            f(&mut s.config);
            s.invalidate();
        })
    }

    /// Remote endpoint.
    pub fn uri(&self) -> Option<String> {
        self.engine.read(self.id, |s| s.config.uri.clone()).ok().flatten()
    }

    /// Number of records.
    pub fn total(&self) -> usize {
        self.engine.read(self.id, |s| s.index.total()).unwrap_or(0)
    }

    /// True once a batch has completed.
    pub fn loaded(&self) -> bool {
        self.engine.read(self.id, |s| s.loaded).unwrap_or(false)
    }

    /// True once a record has been crawled.
    pub fn crawled(&self) -> bool {
        self.engine.read(self.id, |s| s.crawled).unwrap_or(false)
    }

    /// Fields holding child stores.
    pub fn collections(&self) -> Vec<String> {
        self.engine
            .read(self.id, |s| s.collections.clone())
            .unwrap_or_default()
    }

    /// Record keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.engine
            .read(self.id, |s| s.index.records().iter().map(|r| r.key.clone()).collect())
            .unwrap_or_default()
    }

    /// Position of a key.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.engine.read(self.id, |s| s.index.position(key)).ok().flatten()
    }

    /// All records in order.
    pub fn records(&self) -> Vec<Record> {
        self.engine
            .read(self.id, |s| s.index.records().to_vec())
            .unwrap_or_default()
    }

    /// Number of cached views.
    pub fn view_count(&self) -> usize {
        self.engine.read(self.id, |s| s.views.len()).unwrap_or(0)
    }

    /// Read records. Unknown selectors yield `None`.
    pub fn get(&self, selector: impl Into<Selector>) -> Option<Selection> {
        let selector = selector.into();
        self.engine
            .read(self.id, |s| select(&s.index, &selector))
            .ok()
            .flatten()
    }

    /// Read a single record by key or position.
    pub fn record(&self, selector: impl Into<Selector>) -> Option<Record> {
        match self.get(selector)? {
            Selection::One(record) => Some(record),
            _ => None,
        }
    }

    /// The child store held by a record field, or by the record itself when
    /// it was replaced through `generate`.
    pub fn child(&self, key: &str, field: Option<&str>) -> Option<Store> {
        let record = self.record(key)?;
        let id = match field {
            Some(field) => record.field(field)?.as_store()?,
            None => record.nested?,
        };
        self.engine.store(id)
    }

    /// Rebuild the key map in sequence order.
    ///
    /// Without a key field, numeric keys are renumbered to their position.
    pub fn reindex(&self) -> Result<()> {
        self.engine.write(self.id, |s| {
            s.invalidate();
            let renumber = s.config.key.is_none();
            s.index.reindex(renumber);
        })
    }

    /// Reset the store.
    ///
    /// `sync` resets only the records, keys, views and flags. A full clear
    /// also restores the default configuration and drops the expiry timer
    /// and subscription.
    pub fn clear(&self, sync: bool) -> Result<()> {
        if !sync {
            self.notify(Event::BeforeDataClear, Value::Null);
        }

        let (children, timer, subscription, events) = self.engine.write(self.id, |s| {
            let children = s.reset();
            if sync {
                return (children, None, None, s.config.events);
            }
            let events = s.config.events;
            s.config = StoreConfig::default();
            (children, s.timer.take(), s.subscription.take(), events)
        })?;

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(uri) = subscription {
            self.engine.bus().remove(&uri, Some(&self.subscription_id()));
        }
        self.release_children(children);

        tracing::debug!(store = %self.id, sync, "Cleared store");

        if !sync && events {
            let name = self.name()?;
            self.engine
                .bus()
                .fire(&name, Event::AfterDataClear.as_str(), &Value::Null);
        }
        Ok(())
    }

    /// Tear down and release child stores.
    pub(crate) fn release_children(&self, children: Vec<StoreId>) {
        for child in children {
            if let Some(store) = self.engine.store(child) {
                store.teardown();
            }
            self.engine.release(child);
        }
    }

    /// Fire a notification on the store's name, unless events are disabled.
    pub(crate) fn notify(&self, event: Event, payload: Value) {
        let target = self
            .engine
            .read(self.id, |s| s.config.events.then(|| s.name.clone()))
            .ok()
            .flatten();

        if let Some(target) = target {
            self.engine.bus().fire(&target, event.as_str(), &payload);
        }
    }

    /// Reserve a key for a mutation.
    pub(crate) fn guard(&self, key: &str) -> Result<MutationGuard> {
        let reserved = self
            .engine
            .write(self.id, |s| s.pending.insert(key.to_string()))?;
        if !reserved {
            tracing::warn!(store = %self.id, key = %key, "Rejected overlapping mutation");
            return Err(Error::ConcurrentMutation(key.to_string()));
        }
        Ok(MutationGuard {
            engine: self.engine.clone(),
            id: self.id,
            key: key.to_string(),
        })
    }

    /// Subscription id used for expiry-driven re-sync.
    pub(crate) fn subscription_id(&self) -> String {
        format!("dataSync-{}", self.id)
    }
}

/// An already failed operation.
pub(crate) fn fail<T: Send + 'static>(error: Error) -> BoxFuture<'static, Result<T>> {
    Box::pin(futures::future::ready(Err(error)))
}

fn select(index: &RecordIndex, selector: &Selector) -> Option<Selection> {
    match selector {
        Selector::All => Some(Selection::Many(index.records().to_vec())),
        Selector::Key(key) => index.get(key).cloned().map(Selection::One),
        Selector::Index(i) => index.at(*i).cloned().map(Selection::One),
        Selector::Range { start, offset } => Some(Selection::Many(index.slice(*start, *offset).to_vec())),
        Selector::List(items) => Some(Selection::List(
            items
                .iter()
                .map(|item| match select(index, item) {
                    Some(Selection::One(record)) => Some(record),
                    _ => None,
                })
                .collect(),
        )),
    }
}
