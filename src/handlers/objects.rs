//! Object streaming handlers: inline playback, HEAD and download.
//!
//! Objects are addressed by their backend object id.  The metadata store
//! resolves the id to a descriptor; the [`ByteStreamer`](crate::streamer::ByteStreamer)
//! does the rest.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;

use crate::errors::ApiError;
use crate::metadata::store::ObjectDescriptor;
use crate::streamer::Delivery;
use crate::AppState;

async fn resolve(state: &AppState, id: &str) -> Result<ObjectDescriptor, ApiError> {
    state
        .metadata
        .lookup(id)
        .await?
        .ok_or_else(|| ApiError::ObjectNotFound { id: id.to_string() })
}

fn range_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::RANGE).and_then(|v| v.to_str().ok())
}

/// `GET /objects/{id}`: full or partial content.
#[utoipa::path(
    get,
    path = "/objects/{id}",
    tag = "Objects",
    operation_id = "GetObject",
    params(("id" = String, Path, description = "Backend object id")),
    responses(
        (status = 200, description = "Whole object"),
        (status = 206, description = "Partial content (range request)"),
        (status = 404, description = "Object not found", body = crate::errors::ErrorBody),
        (status = 416, description = "Range not satisfiable"),
        (status = 503, description = "No backend connection available", body = crate::errors::ErrorBody)
    )
)]
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let descriptor = resolve(&state, &id).await?;
    state
        .streamer
        .respond(&descriptor, range_header(&headers), Delivery::Inline)
        .await
}

/// `HEAD /objects/{id}`: the GET headers, no backend work.
#[utoipa::path(
    head,
    path = "/objects/{id}",
    tag = "Objects",
    operation_id = "HeadObject",
    params(("id" = String, Path, description = "Backend object id")),
    responses(
        (status = 200, description = "Object headers"),
        (status = 206, description = "Partial content headers"),
        (status = 404, description = "Object not found"),
        (status = 416, description = "Range not satisfiable")
    )
)]
pub async fn head_object(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let descriptor = resolve(&state, &id).await?;
    state.streamer.head(&descriptor, range_header(&headers))
}

/// `GET /objects/{id}/download`: whole object as an attachment.
#[utoipa::path(
    get,
    path = "/objects/{id}/download",
    tag = "Objects",
    operation_id = "DownloadObject",
    params(("id" = String, Path, description = "Backend object id")),
    responses(
        (status = 200, description = "Whole object with Content-Disposition: attachment"),
        (status = 404, description = "Object not found", body = crate::errors::ErrorBody),
        (status = 503, description = "No backend connection available", body = crate::errors::ErrorBody)
    )
)]
pub async fn download_object(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let descriptor = resolve(&state, &id).await?;
    state
        .streamer
        .respond(&descriptor, None, Delivery::Attachment)
        .await
}
