//! Upload entry points: multipart upload, URL ingest and progress polling.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::errors::ApiError;
use crate::ingest::IngestRequest;
use crate::AppState;

fn bad_multipart(e: impl std::fmt::Display) -> ApiError {
    ApiError::InvalidArgument {
        message: format!("invalid multipart body: {}", e),
    }
}

/// Spool the `file` field into the spool directory, rejecting it once it
/// grows past `limit`.
async fn spool_field(
    mut field: Field<'_>,
    dir: &std::path::Path,
    limit: u64,
) -> Result<(PathBuf, u64), ApiError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ApiError::InternalError(e.into()))?;
    let (file, path) = tempfile::Builder::new()
        .prefix("chunkvault-upload-")
        .tempfile_in(dir)
        .and_then(|f| f.keep().map_err(|e| e.error))
        .map_err(|e| ApiError::InternalError(e.into()))?;
    let mut file = tokio::fs::File::from_std(file);

    let mut written: u64 = 0;
    let result = async {
        while let Some(chunk) = field.chunk().await.map_err(bad_multipart)? {
            written += chunk.len() as u64;
            if written > limit {
                return Err(ApiError::EntityTooLarge {
                    size: written,
                    limit,
                });
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| ApiError::InternalError(e.into()))?;
        }
        file.flush()
            .await
            .map_err(|e| ApiError::InternalError(e.into()))
    }
    .await;

    match result {
        Ok(()) => Ok((path, written)),
        Err(e) => {
            let _ = tokio::fs::remove_file(&path).await;
            Err(e)
        }
    }
}

/// `POST /api/upload`: multipart fields `file` and `user_id`. The file is
/// spooled, then uploaded in the background.
#[utoipa::path(
    post,
    path = "/api/upload",
    tag = "Uploads",
    operation_id = "UploadFile",
    responses(
        (status = 200, description = "Upload started; poll the returned task id"),
        (status = 400, description = "Missing field or malformed body", body = crate::errors::ErrorBody),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 413, description = "File too large", body = crate::errors::ErrorBody)
    )
)]
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let dir = state.uploader.spool_dir();
    let limit = state.uploader.max_file_size();

    let mut spooled: Option<(PathBuf, u64, String)> = None;
    let mut user_id: Option<String> = None;

    let outcome: Result<(), ApiError> = async {
        while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
            let name = field.name().map(str::to_string);
            match name.as_deref() {
                Some("file") if spooled.is_none() => {
                    let filename = field
                        .file_name()
                        .map(|n| n.rsplit(['/', '\\']).next().unwrap_or(n).to_string())
                        .filter(|n| !n.is_empty())
                        .unwrap_or_else(|| "upload.bin".to_string());
                    let (path, size) = spool_field(field, &dir, limit).await?;
                    spooled = Some((path, size, filename));
                }
                Some("user_id") => {
                    user_id = Some(field.text().await.map_err(bad_multipart)?);
                }
                _ => {}
            }
        }
        Ok(())
    }
    .await;

    let user_id = user_id.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
    let (path, size, filename) = match (outcome, spooled, user_id.as_ref()) {
        (Ok(()), Some(spooled), Some(_)) => spooled,
        (result, spooled, _) => {
            if let Some((path, _, _)) = spooled {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("Failed to remove spooled file {}: {}", path.display(), e);
                }
            }
            result?;
            return Err(ApiError::InvalidArgument {
                message: "multipart fields 'file' and 'user_id' are required".to_string(),
            });
        }
    };
    let user_id = user_id.unwrap_or_default();

    let task_id = state
        .uploader
        .spawn_upload(path, filename.clone(), user_id, size);
    info!("Upload {} started for {} ({} bytes)", task_id, filename, size);
    Ok(Json(json!({
        "success": true,
        "message": format!("Upload started for {}", filename),
        "task_id": task_id,
        "file_size": size,
    }))
    .into_response())
}

/// `POST /api/download-url`: fetch a URL and upload it in the background.
#[utoipa::path(
    post,
    path = "/api/download-url",
    tag = "Uploads",
    operation_id = "IngestUrl",
    request_body = IngestRequest,
    responses(
        (status = 200, description = "Download started; poll the returned task id"),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorBody),
        (status = 401, description = "Missing or wrong admin token")
    )
)]
pub async fn ingest_url(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> Result<Response, ApiError> {
    let url = request.url.clone();
    let task_id = state.ingest.start(request)?;
    info!("Ingest {} started for {}", task_id, url);
    Ok(Json(json!({
        "success": true,
        "message": "Download started",
        "url": url,
        "task_id": task_id,
    }))
    .into_response())
}

/// `GET /api/progress/{task_id}`: current progress; unknown ids report
/// `not_found`.
#[utoipa::path(
    get,
    path = "/api/progress/{task_id}",
    tag = "Uploads",
    operation_id = "GetProgress",
    params(("task_id" = String, Path, description = "Task id returned by an upload")),
    responses((status = 200, description = "Progress record", body = crate::progress::ProgressRecord))
)]
pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Response {
    let progress = state.progress.get(&task_id);
    Json(json!({ "success": true, "progress": progress })).into_response()
}
