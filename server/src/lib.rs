//! Tether Server - in-memory REST collections for the tether engine.
//!
//! Serves `GET|POST /{collection}` and `GET|PUT|DELETE /{collection}/{id}`
//! over JSON records keyed by `id`, advertising the accepted verbs of every
//! resource in an `Allow` header.

pub mod collections;
pub mod config;
pub mod error;
mod routes;

use crate::collections::Collections;
use crate::config::Config;
use axum::{middleware, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub collections: Arc<Collections>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Empty collections honoring the configured read-only set.
    pub fn new(config: Config) -> Self {
        Self {
            collections: Arc::new(Collections::new(config.read_only.clone())),
            config: Arc::new(config),
        }
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(middleware::from_fn_with_state(state.clone(), routes::allow_header))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
