//! Transport layer abstraction.
//!
//! The engine never opens sockets itself. An [`HttpBackend`] performs the raw
//! exchange; [`crate::Client`] layers status mapping, permissions and caching
//! on top. [`MockBackend`] is a scriptable backend for tests.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// HTTP verbs understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Head,
    Options,
    Post,
    Put,
    Patch,
    Delete,
}

impl Verb {
    /// Upper-case method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Head => "HEAD",
            Verb::Options => "OPTIONS",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
        }
    }

    /// True for verbs that never change server state.
    pub fn is_safe(&self) -> bool {
        matches!(self, Verb::Get | Verb::Head | Verb::Options)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Verb::Get),
            "HEAD" => Ok(Verb::Head),
            "OPTIONS" => Ok(Verb::Options),
            "POST" => Ok(Verb::Post),
            "PUT" => Ok(Verb::Put),
            "PATCH" => Ok(Verb::Patch),
            "DELETE" | "DEL" => Ok(Verb::Delete),
            other => Err(crate::Error::invalid(format!("unknown verb '{}'", other))),
        }
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub uri: String,
    pub verb: Verb,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
    /// Send cookies/credentials with the request
    pub credentials: bool,
    pub timeout: Duration,
}

impl HttpRequest {
    /// Create a request with no body or headers.
    pub fn new(verb: Verb, uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            verb,
            body: None,
            headers: BTreeMap::new(),
            credentials: false,
            timeout: Duration::from_secs(30),
        }
    }
}

/// A raw response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl HttpResponse {
    /// A response with a JSON body.
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Some(body),
        }
    }

    /// A response without a body.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Header lookup, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw network exchange.
///
/// Errors are transport-level failures (connection refused, invalid body);
/// HTTP error statuses are returned as responses.
pub trait HttpBackend: Send + Sync {
    /// Perform a request.
    fn send(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse, String>>;

    /// Fetch a resource in callback mode.
    ///
    /// The default issues a GET with the callback name as a query parameter.
    fn jsonp(&self, uri: &str, callback: &str) -> BoxFuture<'static, Result<Value, String>> {
        let separator = if uri.contains('?') { '&' } else { '?' };
        let request = HttpRequest::new(
            Verb::Get,
            format!("{}{}callback={}", uri, separator, callback),
        );
        let response = self.send(request);

        Box::pin(async move {
            let response = response.await?;
            match response.status {
                200..=299 => Ok(response.body.unwrap_or(Value::Null)),
                status => Err(format!("callback request failed with status {}", status)),
            }
        })
    }
}

#[derive(Debug, Clone)]
enum Route {
    Respond(HttpResponse),
    Fail(String),
    Hang,
}

/// Scriptable in-memory backend.
///
/// Routes are keyed by verb and exact URI. Unrouted requests answer 404.
/// Every request is recorded.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    routes: Arc<Mutex<HashMap<(Verb, String), Route>>>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl MockBackend {
    /// Create a backend with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `verb uri` with `response`.
    pub fn on(&self, verb: Verb, uri: impl Into<String>, response: HttpResponse) -> &Self {
        self.routes
            .lock()
            .insert((verb, uri.into()), Route::Respond(response));
        self
    }

    /// Answer `GET uri` with `200` and a JSON body.
    pub fn get(&self, uri: impl Into<String>, body: Value) -> &Self {
        self.on(Verb::Get, uri, HttpResponse::json(200, body))
    }

    /// Fail `verb uri` at the transport level.
    pub fn fail(&self, verb: Verb, uri: impl Into<String>, message: impl Into<String>) -> &Self {
        self.routes
            .lock()
            .insert((verb, uri.into()), Route::Fail(message.into()));
        self
    }

    /// Never answer `verb uri`.
    pub fn hang(&self, verb: Verb, uri: impl Into<String>) -> &Self {
        self.routes.lock().insert((verb, uri.into()), Route::Hang);
        self
    }

    /// Every request sent so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests sent for `verb uri`.
    pub fn count(&self, verb: Verb, uri: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.verb == verb && r.uri == uri)
            .count()
    }
}

impl HttpBackend for MockBackend {
    fn send(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse, String>> {
        let route = self
            .routes
            .lock()
            .get(&(request.verb, request.uri.clone()))
            .cloned();
        self.requests.lock().push(request);

        Box::pin(async move {
            // Complete on a later poll, like a real exchange
            tokio::task::yield_now().await;
            match route {
                Some(Route::Respond(response)) => Ok(response),
                Some(Route::Fail(message)) => Err(message),
                Some(Route::Hang) => futures::future::pending().await,
                None => Ok(HttpResponse::status(404)),
            }
        })
    }
}
