//! # Tether Engine
//!
//! A client-side object store that mirrors REST collections.
//!
//! Records live in stores held by an [`Engine`] arena. A store can be bound
//! to a collection endpoint: it then loads the collection, writes changes
//! back with `POST`/`PUT`/`DELETE`, and re-syncs whenever the endpoint's
//! cache entry expires.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is a key plus classified [`Field`]s. Records are kept in
//! insertion order with a key index; see [`RecordIndex`].
//!
//! ### Stores
//!
//! A [`Store`] is a cheap handle into the arena. Reads are synchronous;
//! operations that may touch the network return boxed futures.
//!
//! - [`Store::set`] / [`Store::del`] - single-record mutations
//! - [`Store::batch`] - many records at once, first failure wins
//! - [`Store::sync`] / [`Store::set_uri`] - load from an endpoint
//! - [`Store::crawl`] - turn references into child stores
//! - [`Store::sort`] / [`Store::find`] - cached views and search
//!
//! ### Collaborators
//!
//! The engine talks to the outside world through three traits, each with
//! an in-process default: [`HttpBackend`] ([`MockBackend`] for tests),
//! [`UriCache`] ([`MemoryCache`]) and [`EventBus`] ([`Observer`]).
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::{Engine, MockBackend, Sensitivity, StoreConfig};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let backend = MockBackend::new();
//! backend.get("https://api.test/users", json!([
//!     {"id": 1, "name": "Bob"},
//!     {"id": 2, "name": "Ann"},
//! ]));
//!
//! let engine = Engine::new(backend);
//! let users = engine
//!     .factory("users", None, StoreConfig::new().with_key("id").with_uri("https://api.test/users"))
//!     .await
//!     .unwrap();
//!
//! assert_eq!(users.total(), 2);
//! let sorted = users.sort("name", false, Sensitivity::default()).unwrap();
//! assert_eq!(sorted[0].key, "2");
//! # }
//! ```
//!
//! ## Persistence
//!
//! [`Store::save`] and [`Store::restore`] move a [`StoreSnapshot`] through
//! any [`Storage`].

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod index;
pub mod record;
pub mod settle;
pub mod snapshot;
pub mod store;
pub mod transport;
pub mod uri;
pub mod value;

// Re-export main types at crate root
pub use cache::{CacheEntry, CacheField, MemoryCache, Permission, UriCache};
pub use client::{Client, RequestOptions};
pub use config::{EngineConfig, StoreConfig};
pub use error::{Error, Result};
pub use events::{Event, EventBus, Handler, Observer};
pub use index::RecordIndex;
pub use record::{Data, Record};
pub use settle::Deferred;
pub use snapshot::{MemoryStorage, SnapshotRecord, Storage, StoreSnapshot};
pub use store::{BatchKind, Engine, EngineBuilder, Selection, Selector, Sensitivity, Store};
pub use transport::{HttpBackend, HttpRequest, HttpResponse, MockBackend, Verb};
pub use value::{walk, Field, StoreId};

/// Primary key of a record
pub type RecordKey = String;
