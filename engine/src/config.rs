//! Store and engine configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Per-store configuration.
///
/// A store created by the crawler or by `generate` receives a copy of the
/// relevant parts of its parent's configuration at creation time. Later
/// changes to the parent are not propagated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Remote collection endpoint
    pub uri: Option<String>,
    /// Field used as primary key; `None` means keys are assigned
    pub key: Option<String>,
    /// Field naming a sub-resource that holds the real record data
    pub pointer: Option<String>,
    /// Path walked into every fetched payload before use
    pub source: Option<String>,
    /// Fields never crawled and excluded from merges
    pub ignore: Vec<String>,
    /// Fields treated as terminal by the crawler
    pub leafs: Vec<String>,
    /// Propagate crawling to descendants
    pub recursive: bool,
    /// Crawl records after they are set
    pub retrieve: bool,
    /// Headers sent with every request
    pub headers: BTreeMap<String, String>,
    /// Send credentials with requests
    pub credentials: bool,
    /// Callback parameter; when set the store fetches in callback (JSONP) mode
    pub callback: Option<String>,
    /// Automatic re-sync interval
    #[serde(with = "millis")]
    pub expires: Option<Duration>,
    /// Fire notifications for this store
    pub events: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Accept".to_string(), "application/json".to_string());

        Self {
            uri: None,
            key: None,
            pointer: None,
            source: None,
            ignore: Vec::new(),
            leafs: Vec::new(),
            recursive: false,
            retrieve: false,
            headers,
            credentials: false,
            callback: None,
            expires: None,
            events: true,
        }
    }
}

impl StoreConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the remote endpoint.
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Sets the primary key field.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the pointer field.
    pub fn with_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.pointer = Some(pointer.into());
        self
    }

    /// Sets the source path.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Adds ignored fields.
    pub fn with_ignore<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Adds leaf fields.
    pub fn with_leafs<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leafs.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Enables crawling after set, optionally recursing into child stores.
    pub fn with_retrieve(mut self, recursive: bool) -> Self {
        self.retrieve = true;
        self.recursive = recursive;
        self
    }

    /// Adds a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sends credentials with requests.
    pub fn with_credentials(mut self) -> Self {
        self.credentials = true;
        self
    }

    /// Switches the store to callback (JSONP) fetching.
    pub fn with_callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = Some(callback.into());
        self
    }

    /// Disables notifications.
    pub fn without_events(mut self) -> Self {
        self.events = false;
        self
    }

    /// True if a field is ignored or a leaf.
    pub fn skips(&self, field: &str) -> bool {
        self.is_ignored(field) || self.is_leaf(field)
    }

    /// True if a field is ignored.
    pub fn is_ignored(&self, field: &str) -> bool {
        self.ignore.iter().any(|f| f == field)
    }

    /// True if a field is a leaf.
    pub fn is_leaf(&self, field: &str) -> bool {
        self.leafs.iter().any(|f| f == field)
    }

    /// Configuration inherited by a child store.
    ///
    /// `field` is the parent field the child is created for; `retrieve` and
    /// `recursive` only propagate when it is not a declared leaf.
    pub fn inherit(&self, field: &str) -> Self {
        let mut headers = StoreConfig::default().headers;
        headers.extend(self.headers.clone());
        let propagate = !self.is_leaf(field) && self.recursive && self.retrieve;

        Self {
            key: self.key.clone(),
            pointer: self.pointer.clone(),
            source: self.source.clone(),
            ignore: self.ignore.clone(),
            leafs: self.leafs.clone(),
            headers,
            credentials: self.credentials,
            recursive: propagate,
            retrieve: propagate,
            events: self.events,
            ..Self::default()
        }
    }
}

/// Engine-wide tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Default batch chunk size
    pub chunk_size: usize,
    /// Timeout for standard requests
    pub request_timeout: Duration,
    /// Timeout for callback (JSONP) requests
    pub callback_timeout: Duration,
    /// Shortest allowed expiry period
    pub min_expiry: Duration,
    /// Freshness of a cached GET when the response carries no caching headers
    pub cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            request_timeout: Duration::from_secs(30),
            callback_timeout: Duration::from_secs(30),
            min_expiry: Duration::from_millis(1000),
            cache_ttl: Duration::ZERO,
        }
    }
}

impl EngineConfig {
    /// Sets the default chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the callback timeout.
    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    /// Sets the default freshness of cached responses.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
