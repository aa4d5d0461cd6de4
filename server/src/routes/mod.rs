//! HTTP route definitions.

mod collections;
mod health;

use crate::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::Response,
    Router,
};

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(collections::routes())
}

/// Adds the resource's `Allow` header to every response that lacks one.
pub async fn allow_header(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let allow = state.collections.allow_for_path(request.uri().path());
    let mut response = next.run(request).await;

    if let Some(value) = allow.and_then(|allow| HeaderValue::from_str(&allow).ok()) {
        response.headers_mut().entry(header::ALLOW).or_insert(value);
    }
    response
}
