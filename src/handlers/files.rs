//! File record management: listing, deletion, stats, backup and restore.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::errors::ApiError;
use crate::metadata::store::now_timestamp;
use crate::serialization::{export_backup, restore_backup, Backup};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: Option<String>,
}

/// `GET /api/files`: records, newest first, optionally for one owner.
#[utoipa::path(
    get,
    path = "/api/files",
    tag = "Files",
    operation_id = "ListFiles",
    params(("user_id" = Option<String>, Query, description = "Only files of this owner")),
    responses((status = 200, description = "File records", body = [crate::metadata::store::FileRecord]))
)]
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let owner = query.user_id.as_deref().filter(|u| !u.is_empty());
    let files = state.metadata.list_files(owner).await?;
    Ok(Json(json!({ "success": true, "files": files })).into_response())
}

/// `DELETE /api/files/{id}`: remove the record and its backend object.
#[utoipa::path(
    delete,
    path = "/api/files/{id}",
    tag = "Files",
    operation_id = "DeleteFile",
    params(("id" = String, Path, description = "File id")),
    responses(
        (status = 200, description = "File deleted"),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 404, description = "File not found", body = crate::errors::ErrorBody)
    )
)]
pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match state.uploader.delete(&id).await? {
        Some(record) => {
            info!("Deleted file {} ({})", record.id, record.display_name);
            Ok(Json(json!({ "success": true, "message": "File deleted" })).into_response())
        }
        None => Err(ApiError::ObjectNotFound { id }),
    }
}

/// `GET /api/stats`: store totals and per-connection load.
#[utoipa::path(
    get,
    path = "/api/stats",
    tag = "Files",
    operation_id = "GetStats",
    responses(
        (status = 200, description = "Store and pool statistics"),
        (status = 401, description = "Missing or wrong admin token")
    )
)]
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let stats = state.metadata.stats().await?;
    Ok(Json(json!({
        "success": true,
        "stats": stats,
        "clients_connected": state.pool.len(),
        "default_connection": state.pool.default_connection(),
        "connections": state.pool.snapshot(),
        "timestamp": now_timestamp(),
    }))
    .into_response())
}

/// `POST /api/backup`: every record as a JSON document.
#[utoipa::path(
    post,
    path = "/api/backup",
    tag = "Files",
    operation_id = "Backup",
    responses(
        (status = 200, description = "Backup document"),
        (status = 401, description = "Missing or wrong admin token")
    )
)]
pub async fn backup(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let backup = export_backup(state.metadata.as_ref()).await?;
    info!("Exported {} file records", backup.files.len());
    Ok(Json(json!({
        "success": true,
        "backup": backup,
        "timestamp": now_timestamp(),
    }))
    .into_response())
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RestoreRequest {
    pub backup: Option<Backup>,
    #[serde(default)]
    pub replace: bool,
}

/// `POST /api/restore`: load a backup document.
#[utoipa::path(
    post,
    path = "/api/restore",
    tag = "Files",
    operation_id = "Restore",
    responses(
        (status = 200, description = "Backup restored"),
        (status = 400, description = "Backup data missing or invalid", body = crate::errors::ErrorBody),
        (status = 401, description = "Missing or wrong admin token")
    )
)]
pub async fn restore(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RestoreRequest>,
) -> Result<Response, ApiError> {
    let backup = request.backup.ok_or_else(|| ApiError::InvalidArgument {
        message: "Backup data required".to_string(),
    })?;
    backup
        .check_version()
        .map_err(|e| ApiError::InvalidArgument {
            message: e.to_string(),
        })?;
    let result = restore_backup(state.metadata.as_ref(), backup, request.replace).await?;
    info!(
        "Restored {} file records ({} skipped, {} removed)",
        result.imported, result.skipped, result.removed
    );
    Ok(Json(json!({
        "success": true,
        "message": "Database restored successfully",
        "imported": result.imported,
        "skipped": result.skipped,
        "removed": result.removed,
        "warnings": result.warnings,
    }))
    .into_response())
}
