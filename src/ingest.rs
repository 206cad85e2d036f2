//! URL ingest.
//!
//! Fetches a remote URL into the spool directory and hands the file to the
//! [`Uploader`].  The task id is registered before the fetch starts, so
//! clients can poll progress for the whole operation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use garde::Validate;
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::errors::ApiError;
use crate::progress::ProgressTracker;
use crate::upload::Uploader;

/// Body of `POST /api/download-url`.
#[derive(Debug, Clone, Deserialize, Validate, utoipa::ToSchema)]
pub struct IngestRequest {
    #[garde(url)]
    pub url: String,
    /// Display name; derived from the response when absent.
    #[serde(default)]
    #[garde(length(min = 1, max = 255))]
    pub filename: Option<String>,
    #[garde(length(min = 1, max = 128))]
    pub user_id: String,
}

/// A fetched file waiting in the spool directory.
#[derive(Debug)]
pub struct Fetched {
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
}

/// Fetches URLs and feeds them to the uploader.
#[derive(Clone)]
pub struct UrlIngest {
    client: reqwest::Client,
    uploader: Uploader,
    progress: Arc<ProgressTracker>,
}

impl UrlIngest {
    pub fn new(uploader: Uploader, progress: Arc<ProgressTracker>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            uploader,
            progress,
        })
    }

    /// Validate `request`, register its task and run fetch plus upload in
    /// the background. Returns the task id.
    pub fn start(&self, request: IngestRequest) -> Result<String, ApiError> {
        request.validate().map_err(|e| ApiError::InvalidArgument {
            message: e.to_string(),
        })?;

        let task_id = ProgressTracker::new_task_id(&request.user_id);
        let label = request.filename.clone().unwrap_or_else(|| request.url.clone());
        self.progress.start(&task_id, &label, 0);

        let ingest = self.clone();
        let task = task_id.clone();
        tokio::spawn(async move { ingest.run(&task, request).await });
        Ok(task_id)
    }

    async fn run(&self, task_id: &str, request: IngestRequest) {
        match self.fetch(&request.url, request.filename.as_deref()).await {
            Ok(fetched) => {
                info!(
                    "Fetched {} ({} bytes) for task {}",
                    request.url, fetched.size, task_id
                );
                // Outcome is reported through the progress tracker.
                let _ = self
                    .uploader
                    .upload_file(
                        task_id,
                        fetched.path,
                        &fetched.filename,
                        &request.user_id,
                        fetched.size,
                    )
                    .await;
            }
            Err(e) => {
                error!("Fetch of {} failed: {}", request.url, e);
                self.progress.fail(task_id, &e.to_string());
            }
        }
    }

    /// Stream `url` into a spool file, enforcing the upload size limit on
    /// both the declared length and the bytes actually read.
    pub async fn fetch(&self, url: &str, filename: Option<&str>) -> Result<Fetched, ApiError> {
        let limit = self.uploader.max_file_size();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ApiError::InternalError(anyhow::anyhow!("Failed to download: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::InternalError(anyhow::anyhow!(
                "Failed to download: HTTP {}",
                status.as_u16()
            )));
        }

        let filename = match filename.filter(|f| !f.trim().is_empty()) {
            Some(name) => base_name(name),
            None => extract_filename(url, response.headers()),
        };
        if let Some(declared) = response.content_length() {
            if declared > limit {
                return Err(ApiError::EntityTooLarge {
                    size: declared,
                    limit,
                });
            }
        }

        let dir = self.uploader.spool_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ApiError::InternalError(e.into()))?;
        let (file, path) = tempfile::Builder::new()
            .prefix("chunkvault-ingest-")
            .tempfile_in(&dir)
            .and_then(|f| f.keep().map_err(|e| e.error))
            .map_err(|e| ApiError::InternalError(e.into()))?;

        match write_body(tokio::fs::File::from_std(file), response, limit).await {
            Ok(size) => Ok(Fetched {
                path,
                filename,
                size,
            }),
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(e)
            }
        }
    }
}

async fn write_body(
    mut file: tokio::fs::File,
    response: reqwest::Response,
    limit: u64,
) -> Result<u64, ApiError> {
    let mut written: u64 = 0;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk
            .map_err(|e| ApiError::InternalError(anyhow::anyhow!("Failed to download: {}", e)))?;
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
        .map_err(|e| ApiError::InternalError(e.into()))?;
    Ok(written)
}

/// Display name from `Content-Disposition`, then the URL path, then
/// `download_<unix seconds>`.
pub fn extract_filename(url: &str, headers: &HeaderMap) -> String {
    if let Some(name) = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(disposition_filename)
    {
        return name;
    }
    if let Some(name) = reqwest::Url::parse(url).ok().and_then(|u| {
        u.path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
    }) {
        let decoded = percent_encoding::percent_decode_str(&name)
            .decode_utf8_lossy()
            .into_owned();
        if !decoded.is_empty() {
            return base_name(&decoded);
        }
    }
    format!("download_{}", chrono::Utc::now().timestamp())
}

/// `filename*=` (RFC 5987) wins over `filename=`.
fn disposition_filename(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';').map(str::trim) {
        let Some((key, raw)) = part.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                if let Some(encoded) = raw.trim().splitn(3, '\'').nth(2) {
                    let decoded = percent_encoding::percent_decode_str(encoded)
                        .decode_utf8_lossy()
                        .into_owned();
                    if !decoded.is_empty() {
                        return Some(base_name(&decoded));
                    }
                }
            }
            "filename" => {
                let name = raw.trim().trim_matches('"');
                if !name.is_empty() {
                    plain = Some(base_name(name));
                }
            }
            _ => {}
        }
    }
    plain
}

fn base_name(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).to_string()
}
