//! Notification bus.
//!
//! Stores announce their lifecycle through an injected [`EventBus`]. The
//! default [`Observer`] keeps listeners in memory, keyed by target.

use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Listener callback.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Notifications fired by stores and the URI cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    BeforeDataSet,
    AfterDataSet,
    FailedDataSet,
    SyncDataSet,
    BeforeDataBatch,
    AfterDataBatch,
    FailedDataBatch,
    BeforeDataDelete,
    AfterDataDelete,
    FailedDataDelete,
    BeforeDataSync,
    AfterDataSync,
    FailedDataSync,
    AfterDataRetrieve,
    FailedDataRetrieve,
    AfterDataTeardown,
    BeforeDataClear,
    AfterDataClear,
    BeforeExpire,
    Expire,
    AfterExpire,
}

impl Event {
    /// Wire name of the notification.
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::BeforeDataSet => "beforeDataSet",
            Event::AfterDataSet => "afterDataSet",
            Event::FailedDataSet => "failedDataSet",
            Event::SyncDataSet => "syncDataSet",
            Event::BeforeDataBatch => "beforeDataBatch",
            Event::AfterDataBatch => "afterDataBatch",
            Event::FailedDataBatch => "failedDataBatch",
            Event::BeforeDataDelete => "beforeDataDelete",
            Event::AfterDataDelete => "afterDataDelete",
            Event::FailedDataDelete => "failedDataDelete",
            Event::BeforeDataSync => "beforeDataSync",
            Event::AfterDataSync => "afterDataSync",
            Event::FailedDataSync => "failedDataSync",
            Event::AfterDataRetrieve => "afterDataRetrieve",
            Event::FailedDataRetrieve => "failedDataRetrieve",
            Event::AfterDataTeardown => "afterDataTeardown",
            Event::BeforeDataClear => "beforeDataClear",
            Event::AfterDataClear => "afterDataClear",
            Event::BeforeExpire => "beforeExpire",
            Event::Expire => "expire",
            Event::AfterExpire => "afterExpire",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publish/subscribe contract used by stores.
pub trait EventBus: Send + Sync {
    /// Subscribe `handler` to `event` on `target` under `id`.
    ///
    /// Subscribing again with the same target, event and id replaces the
    /// previous handler.
    fn on(&self, target: &str, event: &str, handler: Handler, id: &str);

    /// Invoke every handler subscribed to `event` on `target`.
    fn fire(&self, target: &str, event: &str, payload: &Value);

    /// Remove the listeners of `target` registered under `id`, or all of
    /// them when `id` is `None`.
    fn remove(&self, target: &str, id: Option<&str>);
}

struct Listener {
    event: String,
    id: String,
    handler: Handler,
}

/// In-memory [`EventBus`].
#[derive(Default)]
pub struct Observer {
    listeners: DashMap<String, Vec<Listener>>,
}

impl Observer {
    /// Create an empty observer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an observer wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of listeners registered on a target.
    pub fn listener_count(&self, target: &str) -> usize {
        self.listeners.get(target).map(|l| l.len()).unwrap_or(0)
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("targets", &self.listeners.len())
            .finish()
    }
}

impl EventBus for Observer {
    fn on(&self, target: &str, event: &str, handler: Handler, id: &str) {
        let mut listeners = self.listeners.entry(target.to_string()).or_default();
        listeners.retain(|l| !(l.event == event && l.id == id));
        listeners.push(Listener {
            event: event.to_string(),
            id: id.to_string(),
            handler,
        });
    }

    fn fire(&self, target: &str, event: &str, payload: &Value) {
        // Handlers may subscribe or unsubscribe, so none run under the map guard
        let handlers: Vec<Handler> = match self.listeners.get(target) {
            Some(listeners) => listeners
                .iter()
                .filter(|l| l.event == event)
                .map(|l| Arc::clone(&l.handler))
                .collect(),
            None => return,
        };

        tracing::trace!(target_id = %target, event = %event, handlers = handlers.len(), "Firing event");

        for handler in handlers {
            handler(payload);
        }
    }

    fn remove(&self, target: &str, id: Option<&str>) {
        match id {
            None => {
                self.listeners.remove(target);
            }
            Some(id) => {
                let now_empty = match self.listeners.get_mut(target) {
                    Some(mut listeners) => {
                        listeners.retain(|l| l.id != id);
                        listeners.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.listeners.remove(target);
                }
            }
        }
    }
}
