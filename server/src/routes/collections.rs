//! Collection endpoints.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::Value;

use crate::error::Result;
use crate::AppState;

/// Create collection routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/{collection}", get(list_handler).post(create_handler).options(options_handler))
        .route(
            "/{collection}/{id}",
            get(read_handler)
                .put(replace_handler)
                .delete(remove_handler)
                .options(options_handler),
        )
}

/// GET /{collection} - Every record of the collection.
async fn list_handler(State(state): State<AppState>, Path(collection): Path<String>) -> Json<Vec<Value>> {
    Json(state.collections.list(&collection))
}

/// POST /{collection} - Create a record.
async fn create_handler(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse> {
    let (id, record) = state.collections.create(&collection, body)?;
    let location = format!("/{}/{}", collection, id);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(record)))
}

/// GET /{collection}/{id} - One record.
async fn read_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    Ok(Json(state.collections.get(&collection, &id)?))
}

/// PUT /{collection}/{id} - Replace a record.
async fn replace_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    Ok(Json(state.collections.replace(&collection, &id, body)?))
}

/// DELETE /{collection}/{id} - Remove a record.
async fn remove_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    state.collections.remove(&collection, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// OPTIONS - Answered with `Allow` alone.
async fn options_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}
