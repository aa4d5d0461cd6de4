//! HTTP client used by stores.
//!
//! Wraps an [`HttpBackend`] with:
//! - status code mapping into [`Error`]
//! - permission tracking from `Allow` headers and 403/405 answers
//! - GET response caching with `Cache-Control`/`Expires` freshness
//! - timeouts, including the callback (JSONP) race

use crate::cache::{CacheField, Permission, UriCache};
use crate::config::{EngineConfig, StoreConfig};
use crate::error::{Error, Result};
use crate::settle::Deferred;
use crate::transport::{HttpBackend, HttpRequest, HttpResponse, Verb};
use crate::uri;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Per-request options derived from a store's configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub headers: BTreeMap<String, String>,
    pub credentials: bool,
}

impl From<&StoreConfig> for RequestOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            headers: config.headers.clone(),
            credentials: config.credentials,
        }
    }
}

/// Request dispatcher shared by every store of an engine.
#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn HttpBackend>,
    cache: Arc<dyn UriCache>,
    request_timeout: Duration,
    callback_timeout: Duration,
    cache_ttl: Duration,
}

impl Client {
    /// Create a client over a backend and a URI cache.
    pub fn new(backend: Arc<dyn HttpBackend>, cache: Arc<dyn UriCache>, config: &EngineConfig) -> Self {
        Self {
            backend,
            cache,
            request_timeout: config.request_timeout,
            callback_timeout: config.callback_timeout,
            cache_ttl: config.cache_ttl,
        }
    }

    /// The URI cache.
    pub fn cache(&self) -> &Arc<dyn UriCache> {
        &self.cache
    }

    /// Whether `uri` is known to accept `verb`.
    ///
    /// `None` when nothing is known about the URI's verbs.
    pub fn allows(&self, uri: &str, verb: Verb) -> Option<bool> {
        self.cache
            .get(uri)
            .and_then(|entry| entry.permission)
            .map(|permission| permission.allows(verb))
    }

    /// GET a resource.
    pub fn get(&self, uri: &str, options: &RequestOptions) -> BoxFuture<'static, Result<Option<Value>>> {
        self.request(Verb::Get, uri, None, options)
    }

    /// POST a body to a collection.
    pub fn post(
        &self,
        uri: &str,
        body: Value,
        options: &RequestOptions,
    ) -> BoxFuture<'static, Result<Option<Value>>> {
        self.request(Verb::Post, uri, Some(body), options)
    }

    /// PUT a body to a resource.
    pub fn put(
        &self,
        uri: &str,
        body: Value,
        options: &RequestOptions,
    ) -> BoxFuture<'static, Result<Option<Value>>> {
        self.request(Verb::Put, uri, Some(body), options)
    }

    /// DELETE a resource.
    pub fn delete(&self, uri: &str, options: &RequestOptions) -> BoxFuture<'static, Result<Option<Value>>> {
        self.request(Verb::Delete, uri, None, options)
    }

    /// Perform a request and map the response.
    ///
    /// Resolves to the response body, or `None` for bodiless answers.
    pub fn request(
        &self,
        verb: Verb,
        uri: &str,
        body: Option<Value>,
        options: &RequestOptions,
    ) -> BoxFuture<'static, Result<Option<Value>>> {
        let client = self.clone();
        let uri = uri.to_string();
        let options = options.clone();

        Box::pin(async move {
            if !verb.is_safe() && client.allows(&uri, verb) == Some(false) {
                tracing::debug!(uri = %uri, verb = %verb, "Rejected by cached permission");
                return Err(Error::ServerInvalidMethod);
            }

            if verb == Verb::Get {
                if let Some(entry) = client.cache.get(&uri) {
                    if entry.is_fresh(Utc::now()) {
                        tracing::trace!(uri = %uri, "Serving cached response");
                        return Ok(entry.response);
                    }
                }
            }

            let mut headers = options.headers;
            if body.is_some() && !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                headers.insert("Content-Type".to_string(), "application/json".to_string());
            }

            let request = HttpRequest {
                uri: uri.clone(),
                verb,
                body,
                headers,
                credentials: options.credentials,
                timeout: client.request_timeout,
            };

            tracing::debug!(uri = %uri, verb = %verb, "Sending request");

            let response = match tokio::time::timeout(client.request_timeout, client.backend.send(request)).await {
                Err(_) => {
                    tracing::warn!(uri = %uri, verb = %verb, "Request timed out");
                    return Err(Error::Timeout);
                }
                Ok(Err(message)) => return Err(Error::Transport(message)),
                Ok(Ok(response)) => response,
            };

            client.settle(verb, uri, response).await
        })
    }

    /// Fetch a resource in callback mode.
    ///
    /// The backend call races a timer; whichever settles first wins.
    pub fn jsonp(&self, uri: &str, callback: &str) -> BoxFuture<'static, Result<Option<Value>>> {
        let deferred: Deferred<Option<Value>> = Deferred::new();
        let fetch = self.backend.jsonp(uri, callback);
        let timeout = self.callback_timeout;
        let uri = uri.to_string();

        Box::pin(async move {
            let d = deferred.clone();
            let fetcher = tokio::spawn(async move {
                match fetch.await {
                    Ok(value) => d.resolve(Some(value)),
                    Err(message) => d.reject(Error::Transport(message)),
                };
            });

            let d = deferred.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if d.reject(Error::Timeout) {
                    tracing::warn!(uri = %uri, "Callback request timed out");
                }
            });

            let outcome = deferred.wait().await;
            fetcher.abort();
            timer.abort();
            outcome
        })
    }

    fn settle(&self, verb: Verb, uri: String, response: HttpResponse) -> BoxFuture<'static, Result<Option<Value>>> {
        let client = self.clone();

        Box::pin(async move {
            match response.status {
                200..=299 => {
                    if verb == Verb::Get {
                        client.remember(&uri, &response);
                    } else {
                        client.cache.expire(&uri, true);
                    }

                    match response.status {
                        201 => {
                            let location = response
                                .header("location")
                                .map(str::to_string)
                                .or_else(|| match &response.body {
                                    Some(Value::String(s)) if uri::is_reference(s) => Some(s.clone()),
                                    _ => None,
                                })
                                .map(|l| l.trim().to_string())
                                .filter(|l| !l.is_empty());

                            match location {
                                Some(location) => {
                                    let location = uri::resolve(&uri, &location);
                                    client.get(&location, &RequestOptions::default()).await
                                }
                                None => Err(Error::invalid("created resource has no location")),
                            }
                        }
                        204 | 205 => Ok(None),
                        _ => Ok(response.body),
                    }
                }
                401 => Err(Error::ServerUnauthorized),
                403 => {
                    client.cache.set(&uri, CacheField::Deny(Permission::for_verb(verb)));
                    Err(Error::ServerForbidden)
                }
                405 => {
                    client.cache.set(&uri, CacheField::Deny(Permission::for_verb(verb)));
                    Err(Error::ServerInvalidMethod)
                }
                status => {
                    tracing::warn!(uri = %uri, verb = %verb, status, "Server error");
                    Err(Error::ServerError(status))
                }
            }
        })
    }

    fn remember(&self, uri: &str, response: &HttpResponse) {
        self.cache.set(uri, CacheField::Headers(response.headers.clone()));
        if let Some(allow) = response.header("allow") {
            self.cache.set(uri, CacheField::Permission(Permission::from_allow(allow)));
        }
        self.cache
            .set(uri, CacheField::Expires(freshness(response, self.cache_ttl, Utc::now())));
        if let Some(body) = &response.body {
            self.cache.set(uri, CacheField::Response(body.clone()));
        }
    }
}

/// Freshness deadline of a response.
fn freshness(response: &HttpResponse, ttl: Duration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let cache_control = response.header("cache-control").unwrap_or("").to_ascii_lowercase();
    let pragma = response.header("pragma").unwrap_or("").to_ascii_lowercase();

    if cache_control.contains("no-") || pragma.contains("no-cache") {
        return None;
    }

    if let Some(max_age) = cache_control
        .split(',')
        .filter_map(|d| d.trim().strip_prefix("max-age="))
        .find_map(|v| v.trim().parse::<i64>().ok())
    {
        return chrono::Duration::try_seconds(max_age).and_then(|age| now.checked_add_signed(age));
    }

    if let Some(expires) = response.header("expires") {
        return DateTime::parse_from_rfc2822(expires)
            .ok()
            .map(|at| at.with_timezone(&Utc));
    }

    if ttl.is_zero() {
        None
    } else {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
    }
}
