//! URI cache shared by every store talking to the same endpoint.
//!
//! Holds the last response headers, the last GET response, the permission
//! bitmask and a freshness deadline per URI. There is no isolation between
//! stores: the last writer wins.

use crate::events::{Event, EventBus};
use crate::transport::Verb;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

/// Verbs a URI accepts, encoded as bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Permission(u8);

impl Permission {
    pub const NONE: Permission = Permission(0);
    pub const DELETE: Permission = Permission(1);
    pub const WRITE: Permission = Permission(2);
    pub const READ: Permission = Permission(4);
    pub const PARTIAL: Permission = Permission(8);
    pub const ALL: Permission = Permission(15);

    /// Raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Build from raw bits; unknown bits are dropped.
    pub fn from_bits(bits: u8) -> Self {
        Permission(bits & 0b1111)
    }

    /// The bit a verb requires.
    pub fn for_verb(verb: Verb) -> Self {
        match verb {
            Verb::Get | Verb::Head | Verb::Options => Permission::READ,
            Verb::Post | Verb::Put => Permission::WRITE,
            Verb::Patch => Permission::PARTIAL,
            Verb::Delete => Permission::DELETE,
        }
    }

    /// Union of the bits of every verb named in an `Allow` header value.
    pub fn from_allow(header: &str) -> Self {
        header
            .split(',')
            .filter_map(|v| v.trim().parse::<Verb>().ok())
            .fold(Permission::NONE, |acc, v| acc | Permission::for_verb(v))
    }

    /// True if every bit of `other` is set.
    pub fn contains(self, other: Permission) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if the verb's bit is set.
    pub fn allows(self, verb: Verb) -> bool {
        self.contains(Permission::for_verb(verb))
    }

    /// Clear the bits of `other`.
    pub fn without(self, other: Permission) -> Self {
        Permission(self.0 & !other.0)
    }
}

impl BitOr for Permission {
    type Output = Permission;

    fn bitor(self, rhs: Self) -> Self::Output {
        Permission(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Cached state of a URI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntry {
    /// Headers of the last response
    pub headers: BTreeMap<String, String>,
    /// Body of the last GET
    pub response: Option<Value>,
    /// Accepted verbs; `None` until the server advertises or denies any
    pub permission: Option<Permission>,
    /// Freshness deadline of `response`
    pub expires: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// True while the cached response may be served.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.response.is_some() && self.expires.is_some_and(|at| at > now)
    }
}

/// A single field update.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheField {
    Headers(BTreeMap<String, String>),
    Response(Value),
    Permission(Permission),
    /// Clear bits from the stored permission
    Deny(Permission),
    /// Freshness deadline; `None` marks the response stale
    Expires(Option<DateTime<Utc>>),
}

/// Page-level URI cache contract.
pub trait UriCache: Send + Sync {
    /// Cached entry of a URI.
    fn get(&self, uri: &str) -> Option<CacheEntry>;

    /// Update one field of a URI's entry, creating the entry if needed.
    fn set(&self, uri: &str, field: CacheField);

    /// Drop a URI's entry. Returns `false` if there was none.
    ///
    /// Unless `silent`, dropping an entry fires `beforeExpire`, `expire` and
    /// `afterExpire` on the URI.
    fn expire(&self, uri: &str, silent: bool) -> bool;
}

/// In-memory [`UriCache`].
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    bus: Arc<dyn EventBus>,
}

impl MemoryCache {
    /// Create an empty cache announcing expiries on `bus`.
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            entries: DashMap::new(),
            bus,
        }
    }

    /// Number of cached URIs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl UriCache for MemoryCache {
    fn get(&self, uri: &str) -> Option<CacheEntry> {
        self.entries.get(uri).map(|e| e.clone())
    }

    fn set(&self, uri: &str, field: CacheField) {
        let mut entry = self.entries.entry(uri.to_string()).or_default();
        match field {
            CacheField::Headers(headers) => entry.headers = headers,
            CacheField::Response(response) => entry.response = Some(response),
            CacheField::Permission(permission) => entry.permission = Some(permission),
            CacheField::Deny(permission) => {
                let current = entry.permission.unwrap_or(Permission::ALL);
                entry.permission = Some(current.without(permission));
            }
            CacheField::Expires(at) => entry.expires = at,
        }
    }

    fn expire(&self, uri: &str, silent: bool) -> bool {
        if self.entries.remove(uri).is_none() {
            return false;
        }

        tracing::debug!(uri = %uri, silent, "Expired cache entry");

        if !silent {
            for event in [Event::BeforeExpire, Event::Expire, Event::AfterExpire] {
                self.bus.fire(uri, event.as_str(), &Value::String(uri.to_string()));
            }
        }
        true
    }
}
